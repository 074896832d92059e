//! Error types for the codemachine core.
//!
//! Failures are grouped into families, one enum per family, unified under
//! [`Error`]. Every variant carries a stable machine-readable code
//! (see [`Error::code`]) and a recoverability classification
//! (see [`Error::recoverable`]): recoverable errors may be retried or
//! absorbed by fallback, fatal ones abort the workflow.

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The requested engine id is not registered.
    #[error("engine '{0}' is not registered")]
    NotFound(String),

    /// The registry holds no engines at all.
    #[error("no engines registered")]
    NoneRegistered,

    /// The engine requires authentication before it can run.
    #[error("engine '{0}' requires authentication")]
    AuthRequired(String),

    /// The engine's CLI binary could not be found on this system.
    #[error("engine '{engine}' CLI is not installed: {binary}")]
    CliNotInstalled {
        /// Engine id.
        engine: String,
        /// Binary that failed to launch.
        binary: String,
    },

    /// The engine process ran but reported failure.
    #[error("engine '{engine}' execution failed: {message}")]
    ExecutionFailed {
        /// Engine id.
        engine: String,
        /// Failure detail from the engine.
        message: String,
    },

    /// The run exceeded its timeout.
    #[error("engine '{engine}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Engine id.
        engine: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The engine reported quota exhaustion.
    #[error("engine '{engine}' is rate limited")]
    RateLimited {
        /// Engine id.
        engine: String,
        /// Back-end supplied reason, when present.
        reason: Option<String>,
        /// Seconds until the engine may be retried, when known.
        retry_after_secs: Option<u64>,
    },
}

/// Errors raised while resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A workflow step references an agent with no definition.
    #[error("agent '{0}' not found in configuration")]
    AgentNotFound(String),

    /// An agent's prompt configuration is malformed.
    #[error("invalid prompt configuration for '{agent}': {message}")]
    PromptConfigInvalid {
        /// Agent id.
        agent: String,
        /// What is wrong with it.
        message: String,
    },

    /// A configured file does not exist.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// A configuration value is out of range or malformed.
    #[error("invalid config value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// What is wrong with the value.
        message: String,
    },

    /// A required configuration value is absent.
    #[error("missing required config: {0}")]
    MissingRequired(String),
}

/// Errors raised by the agent monitor store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database is busy; retryable.
    #[error("store busy: {0}")]
    Busy(String),

    /// The database is locked; retryable.
    #[error("store locked: {0}")]
    Locked(String),

    /// No record with the given id.
    #[error("agent record {0} not found")]
    RecordNotFound(i64),

    /// The database could not be opened.
    #[error("store connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema creation or migration failed.
    #[error("store migration failed: {0}")]
    MigrationFailed(String),

    /// A transaction failed to commit; retryable.
    #[error("store transaction failed: {0}")]
    TransactionFailed(String),
}

/// Errors raised by the workflow executor and coordinator.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// A step failed and the failure is not recoverable by fallback.
    #[error("step {index} ('{agent}') failed: {message}")]
    StepExecutionFailed {
        /// Zero-based step index.
        index: usize,
        /// Agent id of the step.
        agent: String,
        /// Failure detail.
        message: String,
    },

    /// The workflow plan contains a step the executor cannot run.
    #[error("invalid step type: {0}")]
    InvalidStepType(String),

    /// A fallback chain references an agent that is not defined.
    #[error("fallback agent '{0}' is missing")]
    FallbackAgentMissing(String),

    /// The coordinator dispatcher failed.
    #[error("coordination error: {0}")]
    CoordinationError(String),

    /// The coordinator script could not be parsed.
    #[error("invalid command syntax: {0}")]
    InvalidCommandSyntax(String),

    /// The workflow was aborted.
    #[error("workflow aborted: {0}")]
    Aborted(String),

    /// An agent's prompt file could not be loaded.
    #[error("failed to load prompt for '{agent}': {message}")]
    PromptLoadFailed {
        /// Agent id.
        agent: String,
        /// Underlying I/O detail.
        message: String,
    },
}

/// Errors raised by input validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A required field is absent.
    #[error("required field '{0}' is missing")]
    RequiredField(String),

    /// A field holds a value of the wrong shape.
    #[error("invalid field '{field}': {message}")]
    InvalidField {
        /// Field name.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The specification file is empty.
    #[error("specification file is empty")]
    SpecificationEmpty,

    /// The specification file does not exist.
    #[error("specification file not found: {0}")]
    SpecificationMissing(String),

    /// The specification file still contains unmodified template content.
    #[error("specification file is an unmodified template")]
    SpecificationTemplate,

    /// A prompt placeholder has no value.
    #[error("placeholder '{0}' has no value")]
    PlaceholderMissing(String),

    /// Content that must be non-empty is empty.
    #[error("empty content for '{0}'")]
    EmptyContent(String),

    /// A value failed a type check.
    #[error("type check failed for '{field}': expected {expected}")]
    TypeCheck {
        /// Field name.
        field: String,
        /// Expected type or shape.
        expected: String,
    },
}

/// Errors raised by path resolution.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// A resolved path escaped its containment root.
    #[error("path traversal attempted: '{candidate}' escapes '{root}'")]
    Traversal {
        /// The offending path.
        candidate: String,
        /// The root it must stay under.
        root: String,
    },
}

/// The unified error type for codemachine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Engine-layer failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Monitor-store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Workflow / coordinator failure.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Validation failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Path-containment failure.
    #[error(transparent)]
    Path(#[from] PathError),

    /// I/O failure outside a more specific family.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The stable, dot-namespaced code for this error.
    ///
    /// Codes are part of the public contract: they appear in logs and in
    /// the single-line failure summary, and never change between releases.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Engine(e) => match e {
                EngineError::NotFound(_) => "engine.not_found",
                EngineError::NoneRegistered => "engine.none_registered",
                EngineError::AuthRequired(_) => "engine.auth_required",
                EngineError::CliNotInstalled { .. } => "engine.cli_not_installed",
                EngineError::ExecutionFailed { .. } => "engine.execution_failed",
                EngineError::Timeout { .. } => "engine.timeout",
                EngineError::RateLimited { .. } => "engine.rate_limited",
            },
            Self::Config(e) => match e {
                ConfigError::AgentNotFound(_) => "config.agent_not_found",
                ConfigError::PromptConfigInvalid { .. } => "config.prompt_config_invalid",
                ConfigError::FileNotFound(_) => "config.file_not_found",
                ConfigError::InvalidValue { .. } => "config.invalid_value",
                ConfigError::MissingRequired(_) => "config.missing_required",
            },
            Self::Store(e) => match e {
                StoreError::Busy(_) => "store.busy",
                StoreError::Locked(_) => "store.locked",
                StoreError::RecordNotFound(_) => "store.record_not_found",
                StoreError::ConnectionFailed(_) => "store.connection_failed",
                StoreError::MigrationFailed(_) => "store.migration_failed",
                StoreError::TransactionFailed(_) => "store.transaction_failed",
            },
            Self::Workflow(e) => match e {
                WorkflowError::StepExecutionFailed { .. } => "workflow.step_execution_failed",
                WorkflowError::InvalidStepType(_) => "workflow.invalid_step_type",
                WorkflowError::FallbackAgentMissing(_) => "workflow.fallback_agent_missing",
                WorkflowError::CoordinationError(_) => "workflow.coordination_error",
                WorkflowError::InvalidCommandSyntax(_) => "workflow.invalid_command_syntax",
                WorkflowError::Aborted(_) => "workflow.aborted",
                WorkflowError::PromptLoadFailed { .. } => "workflow.prompt_load_failed",
            },
            Self::Validation(e) => match e {
                ValidationError::RequiredField(_) => "validation.required_field",
                ValidationError::InvalidField { .. } => "validation.invalid_field",
                ValidationError::SpecificationEmpty => "validation.specification_empty",
                ValidationError::SpecificationMissing(_) => "validation.specification_missing",
                ValidationError::SpecificationTemplate => "validation.specification_template",
                ValidationError::PlaceholderMissing(_) => "validation.placeholder_missing",
                ValidationError::EmptyContent(_) => "validation.empty_content",
                ValidationError::TypeCheck { .. } => "validation.type_check",
            },
            Self::Path(PathError::Traversal { .. }) => "path.traversal",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Whether the failure may clear on retry or fallback.
    ///
    /// Rate-limit and busy/locked/transaction store errors are recoverable;
    /// connection failures, traversal and workflow aborts are fatal, as is
    /// everything not listed here.
    #[must_use]
    pub const fn recoverable(&self) -> bool {
        matches!(
            self,
            Self::Engine(EngineError::RateLimited { .. })
                | Self::Store(
                    StoreError::Busy(_)
                        | StoreError::Locked(_)
                        | StoreError::TransactionFailed(_)
                )
        )
    }
}

/// Matches error text against the markers back-ends use to signal quota
/// exhaustion.
///
/// Recognised markers: HTTP status 429, `quota`, `rate limit` (with or
/// without space), `RESOURCE_EXHAUSTED`. Matching is case-insensitive.
#[must_use]
pub fn is_rate_limit_marker(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("ratelimit")
        || lower.contains("resource_exhausted")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let e: Error = EngineError::RateLimited {
            engine: "m1".into(),
            reason: None,
            retry_after_secs: Some(60),
        }
        .into();
        assert_eq!(e.code(), "engine.rate_limited");

        let e: Error = StoreError::Busy("SQLITE_BUSY".into()).into();
        assert_eq!(e.code(), "store.busy");

        let e: Error = PathError::Traversal {
            candidate: "../etc".into(),
            root: "/tmp".into(),
        }
        .into();
        assert_eq!(e.code(), "path.traversal");
    }

    #[test]
    fn recoverability_classification() {
        let recoverable: [Error; 3] = [
            EngineError::RateLimited {
                engine: "m1".into(),
                reason: None,
                retry_after_secs: None,
            }
            .into(),
            StoreError::Busy("busy".into()).into(),
            StoreError::Locked("locked".into()).into(),
        ];
        for e in &recoverable {
            assert!(e.recoverable(), "{} should be recoverable", e.code());
        }

        let fatal: [Error; 3] = [
            StoreError::ConnectionFailed("no file".into()).into(),
            WorkflowError::Aborted("user stop".into()).into(),
            PathError::Traversal {
                candidate: "..".into(),
                root: "/".into(),
            }
            .into(),
        ];
        for e in &fatal {
            assert!(!e.recoverable(), "{} should be fatal", e.code());
        }
    }

    #[test]
    fn rate_limit_markers() {
        assert!(is_rate_limit_marker("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_marker("Quota exceeded for project"));
        assert!(is_rate_limit_marker("rate limit reached"));
        assert!(is_rate_limit_marker("RESOURCE_EXHAUSTED"));
        assert!(!is_rate_limit_marker("connection refused"));
    }

    #[test]
    fn display_includes_detail() {
        let e: Error = EngineError::Timeout {
            engine: "claude".into(),
            timeout_ms: 5000,
        }
        .into();
        assert!(e.to_string().contains("5000"));
    }
}
