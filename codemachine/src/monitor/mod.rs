//! Agent lifecycle monitoring.
//!
//! Every launched run is registered here and leaves a durable record for
//! post-mortem inspection: identity, status transitions and telemetry,
//! stored in an embedded SQLite database under the workflow root
//! (`logs/registry.db`). All writes are transactional; reads and writes
//! are wrapped in an exponential-backoff retry against busy/locked errors.

mod record;
mod retry;
mod store;

pub use record::{AgentQuery, AgentRecord, AgentStatus, AgentTelemetry, NewAgent, PROMPT_LIMIT};
pub use retry::{with_retry, RetryPolicy};
pub use store::AgentMonitor;
