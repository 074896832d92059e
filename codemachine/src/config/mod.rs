//! Configuration management.
//!
//! Settings come from the process environment (no config file — workflow
//! state lives in `.codemachine/`, see [`paths`]). [`Config::from_env`]
//! reads every recognised variable once at startup; the result is passed
//! down by reference.

mod paths;
mod preset;

pub use paths::WorkflowPaths;
pub use preset::{EnginePreset, PresetEntry, Tier};

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Working-directory override.
pub const ENV_CWD: &str = "CODEMACHINE_CWD";
/// Installation directory.
pub const ENV_HOME: &str = "CODEMACHINE_HOME";
/// Skip engine auth checks (testing only).
pub const ENV_SKIP_AUTH: &str = "CODEMACHINE_SKIP_AUTH";
/// Disable ANSI colour in log output.
pub const ENV_PLAIN_LOGS: &str = "CODEMACHINE_PLAIN_LOGS";
/// Enable debug diagnostics.
pub const ENV_DEBUG: &str = "CODEMACHINE_DEBUG";
/// Log filter directive (overrides `RUST_LOG`).
pub const ENV_LOG: &str = "CODEMACHINE_LOG";
/// Agent id of the parent process, set for child agent processes.
pub const ENV_PARENT_AGENT_ID: &str = "CODEMACHINE_PARENT_AGENT_ID";
/// Auth-cache time-to-live in milliseconds.
pub const ENV_AUTH_CACHE_TTL_MS: &str = "CODEMACHINE_AUTH_CACHE_TTL_MS";
/// Register the mock engine.
pub const ENV_MOCK_ENGINE: &str = "CODEMACHINE_MOCK_ENGINE";

const DEFAULT_AUTH_CACHE_TTL: Duration = Duration::from_millis(300_000);

/// Process-wide configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the workflow operates in; `.codemachine/` lives beneath it.
    pub cwd: PathBuf,
    /// Installation directory, when set.
    pub home: Option<PathBuf>,
    /// Short-circuit every auth check to "authenticated" (testing).
    pub skip_auth: bool,
    /// Render logs without ANSI colour.
    pub plain_logs: bool,
    /// Emit debug diagnostics.
    pub debug: bool,
    /// Log filter directive, when set.
    pub log_filter: Option<String>,
    /// Agent id of the parent process, for child attribution.
    pub parent_agent_id: Option<i64>,
    /// How long a cached auth probe stays valid.
    pub auth_cache_ttl: Duration,
    /// Whether to register the mock engine.
    pub mock_engine: bool,
}

impl Config {
    /// Reads configuration from the process environment.
    ///
    /// Unset variables fall back to defaults; malformed numeric values are
    /// a [`ConfigError::InvalidValue`].
    pub fn from_env() -> Result<Self> {
        let cwd = match env::var_os(ENV_CWD) {
            Some(dir) => PathBuf::from(dir),
            None => env::current_dir()?,
        };

        let parent_agent_id = match env::var(ENV_PARENT_AGENT_ID) {
            Ok(raw) => Some(raw.parse::<i64>().map_err(|e| {
                ConfigError::InvalidValue {
                    key: ENV_PARENT_AGENT_ID.to_string(),
                    message: e.to_string(),
                }
            })?),
            Err(_) => None,
        };

        let auth_cache_ttl = match env::var(ENV_AUTH_CACHE_TTL_MS) {
            Ok(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue {
                    key: ENV_AUTH_CACHE_TTL_MS.to_string(),
                    message: e.to_string(),
                }
            })?),
            Err(_) => DEFAULT_AUTH_CACHE_TTL,
        };

        Ok(Self {
            cwd,
            home: env::var_os(ENV_HOME).map(PathBuf::from),
            skip_auth: env_flag(ENV_SKIP_AUTH),
            plain_logs: env_flag(ENV_PLAIN_LOGS),
            debug: env_flag(ENV_DEBUG),
            log_filter: env::var(ENV_LOG).ok(),
            parent_agent_id,
            auth_cache_ttl,
            mock_engine: env_flag(ENV_MOCK_ENGINE),
        })
    }

    /// The paths of this configuration's workflow root.
    #[must_use]
    pub fn workflow_paths(&self) -> WorkflowPaths {
        WorkflowPaths::new(&self.cwd)
    }

    /// Per-engine config-dir override, e.g. `CODEMACHINE_CLAUDE_CONFIG_DIR`.
    #[must_use]
    pub fn engine_config_dir(engine_id: &str) -> Option<PathBuf> {
        env::var_os(engine_env(engine_id, "CONFIG_DIR")).map(PathBuf::from)
    }

    /// Per-engine API key, e.g. `CODEMACHINE_GEMINI_API_KEY`.
    #[must_use]
    pub fn engine_api_key(engine_id: &str) -> Option<String> {
        env::var(engine_env(engine_id, "API_KEY")).ok()
    }
}

/// `CODEMACHINE_<ENGINE>_<SUFFIX>`, engine id upper-cased with `-` → `_`.
fn engine_env(engine_id: &str, suffix: &str) -> String {
    let id = engine_id.to_uppercase().replace('-', "_");
    format!("CODEMACHINE_{id}_{suffix}")
}

/// Truthy env flag: set to anything except `0`, `false` or empty.
fn env_flag(key: &str) -> bool {
    env::var(key).is_ok_and(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
}
