//! The engine layer: back-end abstraction, registry, rate limiting and
//! cross-engine fallback.
//!
//! An *engine* is one AI code-generation back-end (a long-running CLI
//! subprocess). All engines satisfy the [`Engine`] trait; its central
//! contract is [`Engine::run`], a producer of a lazy, finite stream of
//! tagged [`RunChunk`]s terminated by exactly one [`RunChunk::Result`] —
//! unless the consumer cancels first, in which case the stream ends
//! promptly without a result and any subprocess is terminated.

mod catalog;
mod cli;
mod fallback;
mod mock;
mod rate_limit;
mod registry;

pub use catalog::{builtin_engines, default_registry};
pub use cli::{CliEngine, CliEngineConfig};
pub use fallback::{FallbackOutcome, FallbackRequest, FallbackRunner};
pub use mock::{MockBehavior, MockEngine};
pub use rate_limit::{RateLimitEntry, RateLimitManager, DEFAULT_RETRY_AFTER_SECS};
pub use registry::{EngineRegistry, RegistryBuilder};

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::monitor::AgentTelemetry;

/// Options for one engine run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// The prompt dispatched to the back-end.
    pub prompt: String,
    /// Model override; the engine default applies when absent.
    pub model: Option<String>,
    /// Working directory for the subprocess.
    pub working_dir: Option<PathBuf>,
    /// Upper bound on the run; elapse behaves like a cancel.
    pub timeout: Option<Duration>,
    /// Cancellation token threaded into the stream producer.
    pub cancel: CancellationToken,
    /// Agent id this run belongs to, for log attribution.
    pub agent_id: Option<i64>,
}

impl RunOptions {
    /// Creates options for `prompt` with everything else defaulted.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Sets the model override.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the owning agent id.
    #[must_use]
    pub const fn with_agent_id(mut self, id: i64) -> Self {
        self.agent_id = Some(id);
        self
    }
}

/// A tagged chunk of a streaming engine run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RunChunk {
    /// Incremental stdout text.
    Data(String),
    /// Incremental stderr text.
    ErrorData(String),
    /// Parsed telemetry emitted mid-run.
    Telemetry(AgentTelemetry),
    /// The terminal chunk; exactly one per uncancelled run.
    Result(RunResult),
}

/// The terminal payload of an engine run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Accumulated stdout.
    pub stdout: String,
    /// Accumulated stderr.
    pub stderr: String,
    /// Whether the back-end reported quota exhaustion.
    pub is_rate_limit_error: bool,
    /// When the quota resets, if the back-end said.
    pub rate_limit_resets_at: Option<DateTime<Utc>>,
    /// Seconds until retry, if the back-end said.
    pub retry_after_seconds: Option<u64>,
}

impl RunResult {
    /// A successful result carrying `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// A rate-limited result with an optional retry hint.
    #[must_use]
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self {
            is_rate_limit_error: true,
            retry_after_seconds,
            ..Self::default()
        }
    }
}

/// Stream of tagged chunks produced by [`Engine::run`].
pub type EngineStream = Pin<Box<dyn Stream<Item = RunChunk> + Send>>;

/// Receives chunks as they arrive during a run.
///
/// The fallback runner forwards every `data` / `error-data` / `telemetry`
/// chunk verbatim — including those of attempts that later fail over — and
/// announces engine switches. All methods default to no-ops.
pub trait RunObserver: Send + Sync {
    /// Stdout text arrived.
    fn on_data(&self, _text: &str) {}
    /// Stderr text arrived.
    fn on_error_data(&self, _text: &str) {}
    /// Telemetry arrived.
    fn on_telemetry(&self, _telemetry: &AgentTelemetry) {}
    /// The fallback runner is moving from one engine to the next.
    fn on_engine_switch(&self, _from: &str, _to: &str) {}
}

/// An observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// One AI code-generation back-end.
///
/// Identity is the stable [`Engine::id`]; instances are registered once at
/// process start and immutable thereafter.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable short identifier (`claude`, `gemini`, …).
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Display priority; lower sorts first and is preferred by fallback.
    fn order(&self) -> u32;

    /// Whether the engine is experimental.
    fn experimental(&self) -> bool {
        false
    }

    /// The model used when [`RunOptions::model`] is absent.
    fn default_model(&self) -> &str;

    /// Probes whether the engine has working credentials.
    async fn is_authenticated(&self) -> Result<bool>;

    /// Interactively establishes credentials (inherits the terminal).
    async fn ensure_auth(&self) -> Result<()>;

    /// Discards stored credentials.
    async fn clear_auth(&self) -> Result<()>;

    /// Launches a run, returning the chunk stream.
    async fn run(&self, options: RunOptions) -> Result<EngineStream>;
}
