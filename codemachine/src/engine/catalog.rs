//! Built-in engine definitions.
//!
//! One [`CliEngineConfig`] per supported back-end. The concrete argument
//! shapes match each CLI's non-interactive surface; everything behind them
//! is a black box to the core.

use std::sync::Arc;

use crate::config::Config;

use super::cli::{CliEngine, CliEngineConfig};
use super::mock::MockEngine;
use super::registry::EngineRegistry;
use super::Engine;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// The built-in CLI engines, in display order.
#[must_use]
pub fn builtin_engines() -> Vec<Arc<dyn Engine>> {
    vec![
        Arc::new(CliEngine::new(CliEngineConfig {
            id: "claude".to_string(),
            name: "Claude Code".to_string(),
            order: 1,
            experimental: false,
            default_model: "claude-sonnet-4-5".to_string(),
            binary: "claude".to_string(),
            run_args: strings(&["-p", "{prompt}", "--model", "{model}", "--output-format", "text"]),
            auth_status_args: strings(&["auth", "status"]),
            login_args: strings(&["auth", "login"]),
            logout_args: strings(&["auth", "logout"]),
            config_dir_env: Some("CLAUDE_CONFIG_DIR".to_string()),
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
        })),
        Arc::new(CliEngine::new(CliEngineConfig {
            id: "codex".to_string(),
            name: "Codex CLI".to_string(),
            order: 2,
            experimental: false,
            default_model: "gpt-5-codex".to_string(),
            binary: "codex".to_string(),
            run_args: strings(&["exec", "--model", "{model}", "{prompt}"]),
            auth_status_args: strings(&["login", "status"]),
            login_args: strings(&["login"]),
            logout_args: strings(&["logout"]),
            config_dir_env: Some("CODEX_HOME".to_string()),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
        })),
        Arc::new(CliEngine::new(CliEngineConfig {
            id: "gemini".to_string(),
            name: "Gemini CLI".to_string(),
            order: 3,
            experimental: false,
            default_model: "gemini-2.5-pro".to_string(),
            binary: "gemini".to_string(),
            run_args: strings(&["-p", "{prompt}", "-m", "{model}"]),
            // No quiet probe: the CLI authenticates via its API key env.
            auth_status_args: vec![],
            login_args: vec![],
            logout_args: vec![],
            config_dir_env: Some("GEMINI_CONFIG_DIR".to_string()),
            api_key_env: Some("GEMINI_API_KEY".to_string()),
        })),
        Arc::new(CliEngine::new(CliEngineConfig {
            id: "cursor".to_string(),
            name: "Cursor Agent".to_string(),
            order: 4,
            experimental: true,
            default_model: "auto".to_string(),
            binary: "cursor-agent".to_string(),
            run_args: strings(&["-p", "{prompt}", "--model", "{model}"]),
            auth_status_args: strings(&["status"]),
            login_args: strings(&["login"]),
            logout_args: strings(&["logout"]),
            config_dir_env: None,
            api_key_env: Some("CURSOR_API_KEY".to_string()),
        })),
    ]
}

/// Builds the process registry from `config`: every built-in engine, plus
/// the mock engine when enabled.
#[must_use]
pub fn default_registry(config: &Config) -> EngineRegistry {
    let mut builder = EngineRegistry::builder()
        .auth_cache_ttl(config.auth_cache_ttl)
        .skip_auth(config.skip_auth);
    for engine in builtin_engines() {
        builder = builder.register(engine);
    }
    if config.mock_engine {
        builder = builder.register(Arc::new(MockEngine::responding("mock", "OK")));
    }
    builder.build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn builtins_have_unique_ids_and_orders() {
        let engines = builtin_engines();
        let mut ids: Vec<_> = engines.iter().map(|e| e.id().to_string()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), engines.len());

        let mut orders: Vec<_> = engines.iter().map(|e| e.order()).collect();
        orders.sort_unstable();
        orders.dedup();
        assert_eq!(orders.len(), engines.len());
    }

    #[test]
    fn cursor_is_the_only_experimental_builtin() {
        for engine in builtin_engines() {
            assert_eq!(engine.experimental(), engine.id() == "cursor");
        }
    }

    fn test_config(mock_engine: bool) -> Config {
        Config {
            cwd: std::path::PathBuf::from("."),
            home: None,
            skip_auth: true,
            plain_logs: false,
            debug: false,
            log_filter: None,
            parent_agent_id: None,
            auth_cache_ttl: std::time::Duration::from_secs(300),
            mock_engine,
        }
    }

    #[test]
    fn default_registry_holds_the_builtins() {
        let registry = default_registry(&test_config(false));
        assert_eq!(registry.ids(), vec!["claude", "codex", "gemini", "cursor"]);
    }

    #[test]
    fn mock_engine_registers_behind_the_flag() {
        assert!(!default_registry(&test_config(false)).contains("mock"));
        assert!(default_registry(&test_config(true)).contains("mock"));
    }
}
