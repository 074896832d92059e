//! The workflow layer: typed steps, the step executor and the top-level
//! workflow executor.
//!
//! A workflow is an ordered list of [`WorkflowStep`]s. The
//! [`WorkflowExecutor`] drives them one at a time — honouring pause, skip
//! and stop signals from the control bus, rewinding on loop steps, holding
//! at checkpoints — and delegates each agent step to the [`StepRunner`],
//! which resolves the effective engine, loads the prompt and calls the
//! engine fallback runner.

mod agents;
mod executor;
mod input;
mod state;
mod step;
mod step_runner;

pub use agents::{AgentCatalog, AgentSpec};
pub use executor::{ExecutorState, WorkflowExecutor, WorkflowExecutorBuilder};
pub use input::InputProvider;
pub use state::{ControllerState, StepTrack, WorkflowStateStore};
pub use step::{LoopStep, StepOptions, WorkflowStep};
pub use step_runner::{StepContext, StepOutcome, StepRunner};
