//! The coordinator: ad-hoc multi-agent invocations from a mini-language.
//!
//! A coordinator script combines agent invocations with `&&` (sequential)
//! and `&` (parallel) operators plus bracketed per-command options:
//!
//! ```text
//! prep 'set up the workspace' && w1 'build API' & w2 'build UI' && done
//! reviewer[input:notes.md,tail:100,engine:claude] 'review the diff'
//! ```
//!
//! [`parser`] turns a script into a [`CoordinatorPlan`] — an ordered list
//! of groups, each sequential or parallel — and [`dispatcher`] executes
//! the plan over the engine fallback runner.

mod dispatcher;
mod parser;

pub use dispatcher::{CommandReport, CoordinatorDispatcher, DispatchReport, GroupReport};
pub use parser::{parse_script, Command, CoordinatorPlan, Group, GroupMode};
