//! Agent records, statuses and telemetry.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prompts stored on a record are truncated to this many characters.
pub const PROMPT_LIMIT: usize = 500;

/// Lifecycle state of one agent run.
///
/// Transitions follow a fixed graph (see [`AgentStatus::can_transition_to`]);
/// the terminal states `completed`, `failed` and `skipped` have no outgoing
/// edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered, not yet started.
    Pending,
    /// The engine run is in flight.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with an error. Terminal.
    Failed,
    /// Completed as skipped on user request. Terminal.
    Skipped,
    /// A previous attempt failed; another engine is being tried.
    Retrying,
    /// Step advancement is paused; streaming continues.
    Paused,
    /// Waiting at a user-interaction checkpoint. Transient.
    Checkpoint,
}

impl AgentStatus {
    /// Whether this status has no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the transition `self → to` is on the status graph.
    ///
    /// The graph:
    ///
    /// ```text
    /// pending → running → {completed, failed, skipped}
    /// running ↔ retrying        running ↔ paused
    /// {pending, running, retrying, paused} → checkpoint → running
    /// ```
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self == to {
            return false;
        }
        match self {
            Self::Pending => matches!(to, Self::Running | Self::Checkpoint),
            Self::Running => matches!(
                to,
                Self::Completed
                    | Self::Failed
                    | Self::Skipped
                    | Self::Retrying
                    | Self::Paused
                    | Self::Checkpoint
            ),
            Self::Retrying | Self::Paused => matches!(to, Self::Running | Self::Checkpoint),
            Self::Checkpoint => matches!(to, Self::Running),
            Self::Completed | Self::Failed | Self::Skipped => false,
        }
    }

    /// The stable storage form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
            Self::Paused => "paused",
            Self::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "retrying" => Ok(Self::Retrying),
            "paused" => Ok(Self::Paused),
            "checkpoint" => Ok(Self::Checkpoint),
            other => Err(format!("unknown agent status '{other}'")),
        }
    }
}

/// Telemetry accumulated over one agent run.
///
/// Updates are additive-monotone: numeric fields never decrease across
/// [`AgentTelemetry::merge`], except `duration_ms`, which is recomputed on
/// every update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentTelemetry {
    /// Prompt tokens consumed.
    #[serde(alias = "tokensIn")]
    pub tokens_in: u64,
    /// Completion tokens produced.
    #[serde(alias = "tokensOut")]
    pub tokens_out: u64,
    /// Tokens served from cache, when reported.
    #[serde(default)]
    pub cached: Option<u64>,
    /// Cost in the back-end's currency, when reported.
    #[serde(default)]
    pub cost: Option<f64>,
    /// Wall-clock duration of the run in milliseconds.
    #[serde(default, alias = "durationMs")]
    pub duration_ms: Option<u64>,
}

impl AgentTelemetry {
    /// Folds `update` into `self` under the monotonicity rule.
    pub fn merge(&mut self, update: &Self) {
        self.tokens_in = self.tokens_in.max(update.tokens_in);
        self.tokens_out = self.tokens_out.max(update.tokens_out);
        self.cached = match (self.cached, update.cached) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => b.or(a),
        };
        self.cost = match (self.cost, update.cost) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => b.or(a),
        };
        // Duration is recomputed, not accumulated.
        self.duration_ms = update.duration_ms.or(self.duration_ms);
    }
}

/// A durable record of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Monotonically assigned id.
    pub id: i64,
    /// Agent name (usually the step's agent id).
    pub name: String,
    /// Engine that served (or is serving) the run.
    pub engine: String,
    /// Model, when pinned.
    pub model: Option<String>,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Registering parent, for child agents.
    pub parent_id: Option<i64>,
    /// The prompt, truncated to [`PROMPT_LIMIT`] characters.
    pub prompt: String,
    /// When the run was registered.
    pub start_time: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Telemetry, once any was reported.
    pub telemetry: Option<AgentTelemetry>,
    /// Failure detail for `failed` records.
    pub error: Option<String>,
}

/// Parameters for registering a new agent.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    /// Agent name.
    pub name: String,
    /// Engine id serving the run.
    pub engine: String,
    /// Model, when pinned.
    pub model: Option<String>,
    /// Registering parent.
    pub parent_id: Option<i64>,
    /// Full prompt; truncated on insert.
    pub prompt: String,
}

impl NewAgent {
    /// A new registration for `name` on `engine`.
    #[must_use]
    pub fn new(name: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: engine.into(),
            ..Self::default()
        }
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the parent agent.
    #[must_use]
    pub const fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Sets the prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// Filter for [`crate::monitor::AgentMonitor::query_agents`].
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    /// Restrict to this status.
    pub status: Option<AgentStatus>,
    /// Restrict to this name.
    pub name: Option<String>,
    /// Restrict to children of this record.
    pub parent_id: Option<i64>,
}

/// Truncates `prompt` to [`PROMPT_LIMIT`] characters on a char boundary.
#[must_use]
pub(crate) fn truncate_prompt(prompt: &str) -> String {
    if prompt.chars().count() <= PROMPT_LIMIT {
        prompt.to_string()
    } else {
        prompt.chars().take(PROMPT_LIMIT).collect()
    }
}
