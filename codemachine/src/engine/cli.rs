//! CLI-subprocess engine adapter.
//!
//! Wraps one code-generation CLI as an [`Engine`]: runs are spawned with
//! piped stdio, stdout lines stream as [`RunChunk::Data`], stderr lines as
//! [`RunChunk::ErrorData`], and a stdout line that parses as a telemetry
//! object streams as [`RunChunk::Telemetry`]. On cancel the child is
//! killed and the stream ends without a result; otherwise the stream
//! terminates with exactly one [`RunChunk::Result`].
//!
//! Interactive auth subcommands inherit the terminal; status probes and
//! non-interactive runs do not.

use std::process::Stdio;

use async_stream::stream;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{EngineError, Result, is_rate_limit_marker};
use crate::monitor::AgentTelemetry;

use super::{Engine, EngineStream, RunChunk, RunOptions, RunResult};

/// Placeholder in run-argument templates replaced by the prompt.
const PROMPT_PLACEHOLDER: &str = "{prompt}";
/// Placeholder in run-argument templates replaced by the model.
const MODEL_PLACEHOLDER: &str = "{model}";

/// Static description of one CLI back-end.
#[derive(Debug, Clone)]
pub struct CliEngineConfig {
    /// Stable engine id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Display priority.
    pub order: u32,
    /// Whether the engine is experimental.
    pub experimental: bool,
    /// Model used when the run does not pin one.
    pub default_model: String,
    /// Binary launched for every operation.
    pub binary: String,
    /// Run arguments; `{prompt}` and `{model}` are substituted.
    pub run_args: Vec<String>,
    /// Arguments for a quiet auth probe; empty means "no probe, assume
    /// authenticated".
    pub auth_status_args: Vec<String>,
    /// Arguments for interactive login.
    pub login_args: Vec<String>,
    /// Arguments for logout.
    pub logout_args: Vec<String>,
    /// Child env var receiving the per-engine config-dir override.
    pub config_dir_env: Option<String>,
    /// Child env var receiving the per-engine API key.
    pub api_key_env: Option<String>,
}

/// An [`Engine`] backed by a CLI subprocess.
#[derive(Debug)]
pub struct CliEngine {
    config: CliEngineConfig,
}

impl CliEngine {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: CliEngineConfig) -> Self {
        Self { config }
    }

    /// Base command with per-engine env plumbing applied.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        if let Some(var) = &self.config.config_dir_env {
            if let Some(dir) = Config::engine_config_dir(&self.config.id) {
                cmd.env(var, dir);
            }
        }
        if let Some(var) = &self.config.api_key_env {
            if let Some(key) = Config::engine_api_key(&self.config.id) {
                cmd.env(var, key);
            }
        }
        cmd
    }

    fn spawn_error(&self, e: &std::io::Error) -> EngineError {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::CliNotInstalled {
                engine: self.config.id.clone(),
                binary: self.config.binary.clone(),
            }
        } else {
            EngineError::ExecutionFailed {
                engine: self.config.id.clone(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl Engine for CliEngine {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn order(&self) -> u32 {
        self.config.order
    }

    fn experimental(&self) -> bool {
        self.config.experimental
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    async fn is_authenticated(&self) -> Result<bool> {
        if self.config.auth_status_args.is_empty() {
            return Ok(true);
        }
        let status = self
            .command()
            .args(&self.config.auth_status_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| self.spawn_error(&e))?;
        Ok(status.success())
    }

    async fn ensure_auth(&self) -> Result<()> {
        // Login is interactive: the child owns the terminal until done.
        let status = self
            .command()
            .args(&self.config.login_args)
            .status()
            .await
            .map_err(|e| self.spawn_error(&e))?;
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::AuthRequired(self.config.id.clone()).into())
        }
    }

    async fn clear_auth(&self) -> Result<()> {
        if self.config.logout_args.is_empty() {
            return Ok(());
        }
        let status = self
            .command()
            .args(&self.config.logout_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| self.spawn_error(&e))?;
        if !status.success() {
            warn!(engine = %self.config.id, "logout exited non-zero");
        }
        Ok(())
    }

    async fn run(&self, options: RunOptions) -> Result<EngineStream> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let args: Vec<String> = self
            .config
            .run_args
            .iter()
            .map(|a| {
                a.replace(PROMPT_PLACEHOLDER, &options.prompt)
                    .replace(MODEL_PLACEHOLDER, &model)
            })
            .collect();

        let mut cmd = self.command();
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(&e))?;
        debug!(engine = %self.config.id, model = %model, "launched engine subprocess");

        let stdout = child.stdout.take().ok_or_else(|| EngineError::ExecutionFailed {
            engine: self.config.id.clone(),
            message: "child stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EngineError::ExecutionFailed {
            engine: self.config.id.clone(),
            message: "child stderr not captured".to_string(),
        })?;

        let cancel = options.cancel.clone();
        let engine_id = self.config.id.clone();

        Ok(Box::pin(stream! {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_acc = String::new();
            let mut err_acc = String::new();
            let mut out_done = false;
            let mut err_done = false;

            while !(out_done && err_done) {
                tokio::select! {
                    () = cancel.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            warn!(engine = %engine_id, error = %e, "failed to kill engine subprocess");
                        }
                        let _ = child.wait().await;
                        // cancelled: the stream ends without a result
                        return;
                    }
                    line = out_lines.next_line(), if !out_done => match line {
                        Ok(Some(line)) => {
                            if let Some(telemetry) = parse_telemetry_line(&line) {
                                yield RunChunk::Telemetry(telemetry);
                            } else {
                                out_acc.push_str(&line);
                                out_acc.push('\n');
                                yield RunChunk::Data(line);
                            }
                        }
                        Ok(None) | Err(_) => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line {
                        Ok(Some(line)) => {
                            err_acc.push_str(&line);
                            err_acc.push('\n');
                            yield RunChunk::ErrorData(line);
                        }
                        Ok(None) | Err(_) => err_done = true,
                    },
                }
            }

            let success = match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    warn!(engine = %engine_id, error = %e, "failed to reap engine subprocess");
                    false
                }
            };

            let is_rate_limit_error = !success
                && (is_rate_limit_marker(&err_acc) || is_rate_limit_marker(&out_acc));
            yield RunChunk::Result(RunResult {
                stdout: out_acc,
                stderr: err_acc,
                is_rate_limit_error,
                rate_limit_resets_at: None,
                retry_after_seconds: None,
            });
        }))
    }
}

/// Parses a stdout line as a telemetry object.
///
/// Back-ends that report usage do so as a single JSON line carrying at
/// least `tokens_in`/`tokens_out` (snake or camel case).
fn parse_telemetry_line(line: &str) -> Option<AgentTelemetry> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<AgentTelemetry>(trimmed).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn shell_engine(id: &str, script: &str) -> CliEngine {
        CliEngine::new(CliEngineConfig {
            id: id.to_string(),
            name: format!("Shell ({id})"),
            order: 1,
            experimental: false,
            default_model: "test-model".to_string(),
            binary: "sh".to_string(),
            run_args: vec!["-c".to_string(), script.to_string()],
            auth_status_args: vec![],
            login_args: vec![],
            logout_args: vec![],
            config_dir_env: None,
            api_key_env: None,
        })
    }

    async fn drain(mut stream: EngineStream) -> (Vec<RunChunk>, Option<RunResult>) {
        let mut chunks = Vec::new();
        let mut result = None;
        while let Some(chunk) = stream.next().await {
            if let RunChunk::Result(r) = &chunk {
                result = Some(r.clone());
            }
            chunks.push(chunk);
        }
        (chunks, result)
    }

    #[tokio::test]
    async fn stdout_streams_as_data_and_accumulates() {
        let engine = shell_engine("sh", "echo line-one; echo line-two");
        let stream = engine.run(RunOptions::new("ignored")).await.unwrap();
        let (chunks, result) = drain(stream).await;

        let data: Vec<_> = chunks
            .iter()
            .filter_map(|c| match c {
                RunChunk::Data(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec!["line-one", "line-two"]);

        let result = result.unwrap();
        assert_eq!(result.stdout, "line-one\nline-two\n");
        assert!(!result.is_rate_limit_error);
    }

    #[tokio::test]
    async fn prompt_placeholder_is_substituted() {
        let engine = CliEngine::new(CliEngineConfig {
            run_args: vec!["-c".to_string(), "echo {prompt}".to_string()],
            ..shell_engine("sh", "").config
        });
        let stream = engine.run(RunOptions::new("hello-world")).await.unwrap();
        let (_, result) = drain(stream).await;
        assert_eq!(result.unwrap().stdout, "hello-world\n");
    }

    #[tokio::test]
    async fn stderr_streams_as_error_data() {
        let engine = shell_engine("sh", "echo oops >&2");
        let stream = engine.run(RunOptions::new("x")).await.unwrap();
        let (chunks, result) = drain(stream).await;

        assert!(chunks
            .iter()
            .any(|c| matches!(c, RunChunk::ErrorData(t) if t == "oops")));
        assert_eq!(result.unwrap().stderr, "oops\n");
    }

    #[tokio::test]
    async fn rate_limit_marker_on_failure_flags_result() {
        let engine = shell_engine("sh", "echo 'rate limit exceeded' >&2; exit 1");
        let stream = engine.run(RunOptions::new("x")).await.unwrap();
        let (_, result) = drain(stream).await;
        assert!(result.unwrap().is_rate_limit_error);
    }

    #[tokio::test]
    async fn marker_on_success_is_not_a_rate_limit() {
        let engine = shell_engine("sh", "echo 'discussing rate limit design'");
        let stream = engine.run(RunOptions::new("x")).await.unwrap();
        let (_, result) = drain(stream).await;
        assert!(!result.unwrap().is_rate_limit_error);
    }

    #[tokio::test]
    async fn telemetry_line_streams_as_telemetry() {
        let engine = shell_engine(
            "sh",
            r#"echo answer; echo '{"tokens_in": 120, "tokens_out": 34}'"#,
        );
        let stream = engine.run(RunOptions::new("x")).await.unwrap();
        let (chunks, result) = drain(stream).await;

        let telemetry = chunks.iter().find_map(|c| match c {
            RunChunk::Telemetry(t) => Some(*t),
            _ => None,
        });
        assert_eq!(telemetry.unwrap().tokens_in, 120);
        // telemetry lines stay out of stdout
        assert_eq!(result.unwrap().stdout, "answer\n");
    }

    #[tokio::test]
    async fn cancel_kills_child_and_ends_without_result() {
        let engine = shell_engine("sh", "echo started; sleep 30");
        let options = RunOptions::new("x");
        let cancel = options.cancel.clone();
        let mut stream = engine.run(options).await.unwrap();

        // First line proves the child is up.
        let first = stream.next().await.unwrap();
        assert!(matches!(first, RunChunk::Data(t) if t == "started"));

        cancel.cancel();
        let started = std::time::Instant::now();
        while stream.next().await.is_some() {}
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_binary_is_cli_not_installed() {
        let engine = CliEngine::new(CliEngineConfig {
            binary: "codemachine-test-no-such-binary".to_string(),
            ..shell_engine("ghost", "").config
        });
        let err = match engine.run(RunOptions::new("x")).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.code(), "engine.cli_not_installed");
    }

    #[test]
    fn telemetry_parsing_accepts_camel_case() {
        let t = parse_telemetry_line(r#"{"tokensIn": 9, "tokensOut": 3, "cost": 0.01}"#).unwrap();
        assert_eq!(t.tokens_in, 9);
        assert_eq!(t.cost, Some(0.01));
    }

    #[test]
    fn ordinary_lines_are_not_telemetry() {
        assert!(parse_telemetry_line("plain text").is_none());
        assert!(parse_telemetry_line(r#"{"unrelated": true}"#).is_none());
    }
}
