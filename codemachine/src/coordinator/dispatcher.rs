//! Coordinator plan execution.
//!
//! Groups run strictly in order. Inside a parallel group every command
//! starts concurrently and the group completes when all finish — a failed
//! command is reported but does not cancel its peers. Inside a sequential
//! group a failure aborts the remainder of that group; later groups still
//! run and the report records what happened.
//!
//! Every command goes through the engine fallback runner and is registered
//! with the agent monitor as a child of the coordinating agent.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::engine::{FallbackOutcome, FallbackRequest, FallbackRunner, NoopObserver, RunOptions};
use crate::error::Result;
use crate::monitor::{AgentMonitor, AgentStatus, NewAgent};

use super::parser::{parse_script, Command, Group, GroupMode};

/// What happened to one command.
#[derive(Debug, Clone)]
pub struct CommandReport {
    /// Agent name from the script.
    pub name: String,
    /// Monitor record id of the command's run.
    pub agent_id: Option<i64>,
    /// Engine that served the command, when it ran.
    pub engine_used: Option<String>,
    /// Stdout of the final result, when the command succeeded.
    pub stdout: Option<String>,
    /// Failure detail, when it did not.
    pub error: Option<String>,
}

impl CommandReport {
    /// Whether the command completed successfully.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What happened to one group.
#[derive(Debug, Clone)]
pub struct GroupReport {
    /// The group's mode.
    pub mode: GroupMode,
    /// Per-command reports, in declaration order.
    pub commands: Vec<CommandReport>,
}

/// What happened to a whole script.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Per-group reports, in execution order.
    pub groups: Vec<GroupReport>,
}

impl DispatchReport {
    /// Whether every command in every group succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.groups
            .iter()
            .flat_map(|g| g.commands.iter())
            .all(CommandReport::succeeded)
    }

    /// Every failure, flattened.
    #[must_use]
    pub fn failures(&self) -> Vec<&CommandReport> {
        self.groups
            .iter()
            .flat_map(|g| g.commands.iter())
            .filter(|c| !c.succeeded())
            .collect()
    }
}

/// Executes coordinator plans.
#[derive(Debug, Clone)]
pub struct CoordinatorDispatcher {
    runner: FallbackRunner,
    monitor: Arc<AgentMonitor>,
    /// Engine used when a command does not name one.
    default_engine: String,
    /// Agent the script belongs to; command runs register as its children.
    parent_agent_id: Option<i64>,
}

impl CoordinatorDispatcher {
    /// A dispatcher sending commands through `runner`, defaulting to
    /// `default_engine`, registering runs with `monitor`.
    #[must_use]
    pub fn new(
        runner: FallbackRunner,
        monitor: Arc<AgentMonitor>,
        default_engine: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            monitor,
            default_engine: default_engine.into(),
            parent_agent_id: None,
        }
    }

    /// Registers command runs as children of `parent_agent_id`.
    #[must_use]
    pub const fn with_parent(mut self, parent_agent_id: i64) -> Self {
        self.parent_agent_id = Some(parent_agent_id);
        self
    }

    /// Parses and executes `script`. `base_options` supplies the working
    /// directory and cancellation token every command inherits.
    pub async fn dispatch(&self, script: &str, base_options: &RunOptions) -> Result<DispatchReport> {
        let plan = parse_script(script)?;
        info!(
            groups = plan.groups.len(),
            commands = plan.command_count(),
            "dispatching coordinator plan"
        );

        let mut groups = Vec::with_capacity(plan.groups.len());
        for group in &plan.groups {
            groups.push(self.run_group(group, base_options).await);
        }
        Ok(DispatchReport { groups })
    }

    async fn run_group(&self, group: &Group, base_options: &RunOptions) -> GroupReport {
        let commands = match group.mode {
            GroupMode::Parallel => {
                join_all(
                    group
                        .commands
                        .iter()
                        .map(|command| self.run_command(command, base_options)),
                )
                .await
            }
            GroupMode::Sequential => {
                let mut reports = Vec::with_capacity(group.commands.len());
                let mut aborted = false;
                for command in &group.commands {
                    if aborted {
                        reports.push(CommandReport {
                            name: command.name.clone(),
                            agent_id: None,
                            engine_used: None,
                            stdout: None,
                            error: Some("not run: earlier command in group failed".to_string()),
                        });
                        continue;
                    }
                    let report = self.run_command(command, base_options).await;
                    aborted = !report.succeeded();
                    reports.push(report);
                }
                reports
            }
        };

        GroupReport {
            mode: group.mode,
            commands,
        }
    }

    async fn run_command(&self, command: &Command, base_options: &RunOptions) -> CommandReport {
        let prompt = match self.build_prompt(command, base_options).await {
            Ok(prompt) => prompt,
            Err(e) => {
                return CommandReport {
                    name: command.name.clone(),
                    agent_id: None,
                    engine_used: None,
                    stdout: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let primary = command
            .engine
            .clone()
            .unwrap_or_else(|| self.default_engine.clone());

        let mut options = base_options.clone();
        options.prompt.clone_from(&prompt);
        options.model.clone_from(&command.model);
        options.cancel = base_options.cancel.child_token();
        if let Some(ms) = command.timeout_ms {
            options.timeout = Some(Duration::from_millis(ms));
        }

        let agent_id = match self.register(command, &primary, &prompt).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(command = %command.name, error = %e, "failed to register command run");
                None
            }
        };
        if let Some(id) = agent_id {
            options.agent_id = Some(id);
            let _ = self.monitor.set_status(id, AgentStatus::Running).await;
        }

        let outcome = self
            .runner
            .run(FallbackRequest::new(primary, options), &NoopObserver)
            .await;

        self.finish(command, agent_id, outcome).await
    }

    /// The effective prompt: the scripted text plus the tail of each input
    /// file. Missing input files degrade to nothing rather than failing
    /// the command.
    async fn build_prompt(&self, command: &Command, base_options: &RunOptions) -> Result<String> {
        let mut prompt = command.prompt.clone().unwrap_or_default();

        for input in &command.input {
            let path = match &base_options.working_dir {
                Some(dir) => dir.join(input),
                None => std::path::PathBuf::from(input),
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let content = match command.tail {
                        Some(tail) => tail_lines(&content, tail as usize),
                        None => content,
                    };
                    prompt.push_str("\n\n--- ");
                    prompt.push_str(input);
                    prompt.push_str(" ---\n");
                    prompt.push_str(&content);
                }
                Err(e) => {
                    warn!(input = %input, error = %e, "input file unreadable, continuing without it");
                }
            }
        }

        Ok(prompt)
    }

    async fn register(&self, command: &Command, engine: &str, prompt: &str) -> Result<i64> {
        let mut new = NewAgent::new(&command.name, engine).with_prompt(prompt);
        if let Some(model) = &command.model {
            new = new.with_model(model.clone());
        }
        if let Some(parent) = self.parent_agent_id {
            new = new.with_parent(parent);
        }
        self.monitor.register(new).await
    }

    async fn finish(
        &self,
        command: &Command,
        agent_id: Option<i64>,
        outcome: Result<FallbackOutcome>,
    ) -> CommandReport {
        match outcome {
            Ok(outcome) if !outcome.result.is_rate_limit_error => {
                if let Some(id) = agent_id {
                    let _ = self.monitor.mark_completed(id, None).await;
                }
                CommandReport {
                    name: command.name.clone(),
                    agent_id,
                    engine_used: Some(outcome.engine_used),
                    stdout: Some(outcome.result.stdout),
                    error: None,
                }
            }
            Ok(outcome) => {
                let error = format!(
                    "no engine available for '{}': {}",
                    command.name,
                    outcome.result.stderr.trim()
                );
                if let Some(id) = agent_id {
                    let _ = self.monitor.mark_failed(id, error.clone()).await;
                }
                CommandReport {
                    name: command.name.clone(),
                    agent_id,
                    engine_used: Some(outcome.engine_used),
                    stdout: None,
                    error: Some(error),
                }
            }
            Err(e) => {
                if let Some(id) = agent_id {
                    let _ = self.monitor.mark_failed(id, e.to_string()).await;
                }
                CommandReport {
                    name: command.name.clone(),
                    agent_id,
                    engine_used: None,
                    stdout: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn tail_lines(content: &str, tail: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(tail);
    lines[start..].join("\n")
}
