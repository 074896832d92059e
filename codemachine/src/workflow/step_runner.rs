//! The step executor: one agent step, end to end.
//!
//! For each module step this resolves the effective `(engine, model)`
//! (step override → preset by tier → global override → registry default),
//! loads and expands the agent's prompt, registers the run with the agent
//! monitor, and drives the engine fallback runner — forwarding streamed
//! output and telemetry into the record as it arrives.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EnginePreset, Tier};
use crate::coordinator::{CoordinatorDispatcher, DispatchReport};
use crate::engine::{FallbackRequest, FallbackRunner, RunObserver, RunOptions};
use crate::error::{Error, Result, WorkflowError};
use crate::monitor::{AgentMonitor, AgentStatus, AgentTelemetry, NewAgent};

use super::agents::AgentCatalog;
use super::step::StepOptions;

/// Execution context handed down by the workflow executor for one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Cancellation for this step (a child of the workflow token; skip
    /// cancels it).
    pub cancel: CancellationToken,
    /// Set when the cancellation came from a skip signal.
    pub skip_requested: Arc<AtomicBool>,
    /// Whether a previous attempt of the same step failed.
    pub retrying: bool,
}

impl StepContext {
    /// A context under `cancel` with no skip pending.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            skip_requested: Arc::new(AtomicBool::new(false)),
            retrying: false,
        }
    }
}

/// What one step execution produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Monitor record id.
    pub agent_id: i64,
    /// Terminal status: completed or skipped.
    pub status: AgentStatus,
    /// Accumulated streamed output (preserved even when skipped).
    pub output: String,
    /// Engine that served the run, when one did.
    pub engine_used: Option<String>,
    /// Whether the run fell back off its primary engine.
    pub fell_back: bool,
    /// Every candidate was rate-limited; the executor should wait.
    pub rate_limited: bool,
}

/// Executes single steps on behalf of the workflow executor.
#[derive(Debug, Clone)]
pub struct StepRunner {
    runner: FallbackRunner,
    monitor: Arc<AgentMonitor>,
    catalog: AgentCatalog,
    preset: Option<EnginePreset>,
    global_engine: Option<String>,
    working_dir: PathBuf,
    parent_agent_id: Option<i64>,
}

impl StepRunner {
    /// A step runner over `runner` and `monitor`, resolving agents against
    /// `catalog`, operating in `working_dir`.
    #[must_use]
    pub fn new(
        runner: FallbackRunner,
        monitor: Arc<AgentMonitor>,
        catalog: AgentCatalog,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            monitor,
            catalog,
            preset: None,
            global_engine: None,
            working_dir: working_dir.into(),
            parent_agent_id: None,
        }
    }

    /// Applies a preset (from `--preset`).
    #[must_use]
    pub fn with_preset(mut self, preset: EnginePreset) -> Self {
        self.preset = Some(preset);
        self
    }

    /// Applies a global engine override (from `--engine`).
    #[must_use]
    pub fn with_global_engine(mut self, engine: impl Into<String>) -> Self {
        self.global_engine = Some(engine.into());
        self
    }

    /// Registers launched runs as children of `parent_agent_id`.
    #[must_use]
    pub const fn with_parent(mut self, parent_agent_id: i64) -> Self {
        self.parent_agent_id = Some(parent_agent_id);
        self
    }

    /// The monitor runs register with.
    #[must_use]
    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    /// The fallback runner steps execute through.
    #[must_use]
    pub fn fallback_runner(&self) -> &FallbackRunner {
        &self.runner
    }

    /// Resolves the effective `(engine, model)` for a step.
    ///
    /// Engine precedence: step/agent override → preset row for the step's
    /// tier → global override → first registered engine. Model precedence:
    /// step/agent override → preset row → engine default (left to the
    /// engine by returning `None`).
    pub fn resolve_engine(&self, options: &StepOptions, agent_tier: Tier) -> Result<(String, Option<String>)> {
        let tier = options.tier.unwrap_or(agent_tier);
        let explicit_model = options.model.clone();

        if let Some(engine) = &options.engine {
            return Ok((engine.clone(), explicit_model));
        }
        if let Some(preset) = &self.preset {
            let entry = preset.entry(tier);
            return Ok((
                entry.engine.clone(),
                explicit_model.or_else(|| Some(entry.model.clone())),
            ));
        }
        if let Some(engine) = &self.global_engine {
            return Ok((engine.clone(), explicit_model));
        }
        let first = self
            .runner
            .registry()
            .all()
            .first()
            .ok_or(crate::error::EngineError::NoneRegistered)?
            .id()
            .to_string();
        Ok((first, explicit_model))
    }

    /// Executes one module step.
    pub async fn execute_module(
        &self,
        agent_id: &str,
        options: Option<&StepOptions>,
        ctx: &StepContext,
    ) -> Result<StepOutcome> {
        let spec = self.catalog.get(agent_id)?;
        let mut options = options.cloned().unwrap_or_default();
        // Agent-level pins behave as step overrides of last resort.
        if options.engine.is_none() {
            options.engine.clone_from(&spec.engine);
        }
        if options.model.is_none() {
            options.model.clone_from(&spec.model);
        }

        let (engine, model) = self.resolve_engine(&options, spec.tier)?;
        let prompt = expand_placeholders(&spec.prompt, &self.working_dir).await;

        let mut registration = NewAgent::new(agent_id, &engine).with_prompt(&prompt);
        if let Some(model) = &model {
            registration = registration.with_model(model.clone());
        }
        if let Some(parent) = self.parent_agent_id {
            registration = registration.with_parent(parent);
        }
        let record_id = self.monitor.register(registration).await?;
        let correlation = crate::trace::current()
            .map(|ctx| ctx.correlation_id)
            .unwrap_or_default();
        self.monitor
            .set_status(record_id, AgentStatus::Running)
            .await?;
        if ctx.retrying {
            // Surface the re-attempt on the record before work restarts.
            self.monitor
                .set_status(record_id, AgentStatus::Retrying)
                .await?;
            self.monitor
                .set_status(record_id, AgentStatus::Running)
                .await?;
        }
        info!(
            agent = agent_id,
            record = record_id,
            engine = %engine,
            correlation = %correlation,
            "step started"
        );

        let mut run_options = RunOptions::new(prompt)
            .with_working_dir(&self.working_dir)
            .with_cancel(ctx.cancel.clone())
            .with_agent_id(record_id);
        run_options.model = model;
        if let Some(ms) = options.timeout_ms {
            run_options.timeout = Some(Duration::from_millis(ms));
        }

        let observer = StepObserver::new(Arc::clone(&self.monitor), record_id);
        let request = FallbackRequest::new(engine, run_options)
            .with_chain(options.fallback_chain.clone());

        // The engine run gets a child context so its spawned tasks carry
        // the workflow's correlation id.
        let run = self.runner.run(request, &observer);
        let result = match crate::trace::current() {
            Some(ctx) => crate::trace::scope(ctx.child(), run).await,
            None => run.await,
        };

        match result {
            Ok(outcome) if !outcome.result.is_rate_limit_error => {
                let telemetry = observer.telemetry();
                self.monitor.mark_completed(record_id, telemetry).await?;
                debug!(agent = agent_id, record = record_id, "step completed");
                Ok(StepOutcome {
                    agent_id: record_id,
                    status: AgentStatus::Completed,
                    output: observer.take_output(),
                    engine_used: Some(outcome.engine_used),
                    fell_back: outcome.fell_back,
                    rate_limited: false,
                })
            }
            Ok(outcome) => {
                // Every candidate rate-limited: recoverable, the executor
                // decides whether to wait. The record closes out so the
                // retry registers afresh.
                self.monitor
                    .mark_failed(record_id, outcome.result.stderr.trim())
                    .await?;
                Ok(StepOutcome {
                    agent_id: record_id,
                    status: AgentStatus::Failed,
                    output: observer.take_output(),
                    engine_used: None,
                    fell_back: outcome.fell_back,
                    rate_limited: true,
                })
            }
            Err(Error::Workflow(WorkflowError::Aborted(_)))
                if ctx.skip_requested.load(Ordering::SeqCst) =>
            {
                self.monitor
                    .set_status(record_id, AgentStatus::Skipped)
                    .await?;
                info!(agent = agent_id, record = record_id, "step skipped");
                Ok(StepOutcome {
                    agent_id: record_id,
                    status: AgentStatus::Skipped,
                    output: observer.take_output(),
                    engine_used: None,
                    fell_back: false,
                    rate_limited: false,
                })
            }
            Err(e) => {
                self.monitor.mark_failed(record_id, e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Executes a coordinator-script step: registers the coordinating
    /// agent, then dispatches the script with command runs as its
    /// children.
    pub async fn execute_script(
        &self,
        script: &str,
        ctx: &StepContext,
    ) -> Result<DispatchReport> {
        let (default_engine, _) = self.resolve_engine(&StepOptions::default(), Tier::Standard)?;

        let record_id = self
            .monitor
            .register(
                NewAgent::new("coordinator", &default_engine).with_prompt(script),
            )
            .await?;
        self.monitor
            .set_status(record_id, AgentStatus::Running)
            .await?;

        let dispatcher = CoordinatorDispatcher::new(
            self.runner.clone(),
            Arc::clone(&self.monitor),
            default_engine,
        )
        .with_parent(record_id);

        let base_options = RunOptions::default()
            .with_working_dir(&self.working_dir)
            .with_cancel(ctx.cancel.clone());

        match dispatcher.dispatch(script, &base_options).await {
            Ok(report) => {
                if report.all_succeeded() {
                    self.monitor.mark_completed(record_id, None).await?;
                    Ok(report)
                } else {
                    let failed: Vec<String> = report
                        .failures()
                        .iter()
                        .map(|c| c.name.clone())
                        .collect();
                    let message = format!("commands failed: {}", failed.join(", "));
                    self.monitor.mark_failed(record_id, message.clone()).await?;
                    Err(WorkflowError::CoordinationError(message).into())
                }
            }
            Err(e) => {
                self.monitor.mark_failed(record_id, e.to_string()).await?;
                Err(e)
            }
        }
    }
}

/// Observer wiring streamed chunks into the monitor record.
struct StepObserver {
    monitor: Arc<AgentMonitor>,
    record_id: i64,
    output: Mutex<String>,
    telemetry: Mutex<Option<AgentTelemetry>>,
}

impl StepObserver {
    fn new(monitor: Arc<AgentMonitor>, record_id: i64) -> Self {
        Self {
            monitor,
            record_id,
            output: Mutex::new(String::new()),
            telemetry: Mutex::new(None),
        }
    }

    fn telemetry(&self) -> Option<AgentTelemetry> {
        *self
            .telemetry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn take_output(&self) -> String {
        std::mem::take(
            &mut *self
                .output
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl RunObserver for StepObserver {
    fn on_data(&self, text: &str) {
        let mut output = self
            .output
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        output.push_str(text);
        output.push('\n');
    }

    fn on_telemetry(&self, update: &AgentTelemetry) {
        let merged = {
            let mut slot = self
                .telemetry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut current = slot.unwrap_or_default();
            current.merge(update);
            *slot = Some(current);
            current
        };
        // Persist mid-run so a crash still leaves telemetry behind.
        let monitor = Arc::clone(&self.monitor);
        let record_id = self.record_id;
        tokio::spawn(async move {
            if let Err(e) = monitor.record_telemetry(record_id, merged).await {
                warn!(record = record_id, error = %e, "telemetry write failed");
            }
        });
    }

    fn on_engine_switch(&self, from: &str, to: &str) {
        debug!(from = from, to = to, record = self.record_id, "engine switch");
        let monitor = Arc::clone(&self.monitor);
        let record_id = self.record_id;
        tokio::spawn(async move {
            let _ = monitor.set_status(record_id, AgentStatus::Retrying).await;
            let _ = monitor.set_status(record_id, AgentStatus::Running).await;
        });
    }
}

/// Expands `{file:path}` tokens by reading files under `dir`.
///
/// Partial-success semantics: a missing or unreadable file degrades to an
/// empty string, never failing the step.
pub(crate) async fn expand_placeholders(template: &str, dir: &Path) -> String {
    const OPEN: &str = "{file:";

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        match after.find('}') {
            Some(end) => {
                let path = dir.join(after[..end].trim());
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => out.push_str(&content),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "placeholder file unreadable, substituting empty");
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // No closing brace: keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
