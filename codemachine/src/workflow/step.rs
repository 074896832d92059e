//! Workflow step types.

use serde::{Deserialize, Serialize};

use crate::config::Tier;
use crate::error::{Result, WorkflowError};

/// Per-step overrides applied by the step executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Engine override; wins over preset and global settings.
    pub engine: Option<String>,
    /// Model override.
    pub model: Option<String>,
    /// Workload tier; selects the preset row. Defaults to `standard`.
    pub tier: Option<Tier>,
    /// Engines tried, in order, when the effective engine fails over.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_chain: Vec<String>,
    /// Upper bound on the step's run, in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// A loop node: rewind and re-execute earlier steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStep {
    /// How many steps to rewind.
    pub back_steps: usize,
    /// Iterations before the loop yields.
    pub max_iterations: u32,
    /// Agents skipped during loop re-execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_list: Vec<String>,
}

/// One node of a workflow plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStep {
    /// A single agent invocation.
    Module {
        /// The agent to run.
        agent_id: String,
        /// Step-level overrides.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<StepOptions>,
    },
    /// Children run concurrently; all must be single-agent steps.
    Parallel {
        /// The concurrent children.
        children: Vec<WorkflowStep>,
    },
    /// Children run in order.
    Sequential {
        /// The ordered children.
        children: Vec<WorkflowStep>,
    },
    /// Rewind `back_steps` and re-execute, up to `max_iterations` times.
    Loop(LoopStep),
    /// Hold for user interaction.
    UiCheckpoint {
        /// Why the workflow is holding.
        reason: String,
    },
    /// An ad-hoc multi-agent script (see [`crate::coordinator`]).
    CoordinatorScript {
        /// The script source.
        script: String,
    },
}

impl WorkflowStep {
    /// A module step with no overrides.
    #[must_use]
    pub fn module(agent_id: impl Into<String>) -> Self {
        Self::Module {
            agent_id: agent_id.into(),
            options: None,
        }
    }

    /// The agent id, for single-agent steps.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Module { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    /// Validates structural constraints of this step (recursively).
    ///
    /// Parallel children must be single-agent module steps; loops must
    /// rewind at least one step and allow at least one iteration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Parallel { children } => {
                if children.is_empty() {
                    return Err(
                        WorkflowError::InvalidStepType("empty parallel group".to_string()).into(),
                    );
                }
                for child in children {
                    if !matches!(child, Self::Module { .. }) {
                        return Err(WorkflowError::InvalidStepType(
                            "parallel children must be single-agent steps".to_string(),
                        )
                        .into());
                    }
                }
                Ok(())
            }
            Self::Sequential { children } => {
                for child in children {
                    child.validate()?;
                }
                Ok(())
            }
            Self::Loop(spec) => {
                if spec.back_steps == 0 || spec.max_iterations == 0 {
                    return Err(WorkflowError::InvalidStepType(
                        "loop must rewind at least one step for at least one iteration"
                            .to_string(),
                    )
                    .into());
                }
                Ok(())
            }
            Self::Module { .. } | Self::UiCheckpoint { .. } | Self::CoordinatorScript { .. } => {
                Ok(())
            }
        }
    }
}
