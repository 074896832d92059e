//! The workflow executor: the top-level driver.
//!
//! Drives a list of [`WorkflowStep`]s one at a time through the step
//! runner, reacting to control-bus signals between and during steps:
//!
//! - `pause` toggles a hold on step advancement (the in-flight step keeps
//!   streaming);
//! - `skip` completes the current step as skipped, cancelling its run but
//!   preserving streamed output;
//! - `stop` / `user-stop` cancel everything and wind the workflow down;
//! - `input` / `mode-change` resume checkpoints.
//!
//! Loop steps rewind the index and re-execute; when every fallback
//! candidate is rate-limited the executor parks in `rate_limit_waiting`
//! and polls availability at a bounded cadence.
//!
//! State and step index always change together under one mutex, so
//! observers see a consistent snapshot; if a transition callback fails the
//! transition is not committed and the failure is reported on the bus.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{ControlBus, ControlEvent, EventKind, Subscription};
use crate::error::{Error, Result, WorkflowError};
use crate::monitor::{AgentStatus, NewAgent};

use super::input::InputProvider;
use super::state::{ControllerState, StepTrack, WorkflowStateStore};
use super::step::{StepOptions, WorkflowStep};
use super::step_runner::{StepContext, StepOutcome, StepRunner};

/// Executor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutorState {
    /// Constructed, not yet started.
    Idle,
    /// Advancing through steps.
    Running,
    /// Holding between steps on user request.
    Paused,
    /// Holding at a user-interaction checkpoint.
    Checkpoint,
    /// Every fallback candidate is rate-limited; polling availability.
    RateLimitWaiting,
    /// A stop was acknowledged; winding down.
    Stopping,
    /// Stopped before completion.
    Stopped,
    /// Every step succeeded.
    Completed,
    /// A fatal step error ended the run.
    Error,
}

impl ExecutorState {
    /// The stable lowercase name, as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Checkpoint => "checkpoint",
            Self::RateLimitWaiting => "rate_limit_waiting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent view of the executor, updated atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    state: ExecutorState,
    step_index: usize,
    iteration: u32,
}

/// Hook invoked (under the snapshot mutex) before a transition commits.
pub type TransitionHook =
    Arc<dyn Fn(ExecutorState, usize) -> Result<()> + Send + Sync + 'static>;

struct ControlFlags {
    paused: AtomicBool,
    skip: Arc<AtomicBool>,
    stop: AtomicBool,
    checkpoint_resume: AtomicBool,
    notify: Notify,
    step_cancel: Mutex<CancellationToken>,
}

impl ControlFlags {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            skip: Arc::new(AtomicBool::new(false)),
            stop: AtomicBool::new(false),
            checkpoint_resume: AtomicBool::new(false),
            notify: Notify::new(),
            step_cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

/// Builds a [`WorkflowExecutor`].
pub struct WorkflowExecutorBuilder {
    workflow_id: Option<String>,
    steps: Vec<WorkflowStep>,
    step_runner: StepRunner,
    bus: ControlBus,
    input: InputProvider,
    state_store: Option<WorkflowStateStore>,
    poll_interval: Duration,
    transition_hook: Option<TransitionHook>,
}

impl WorkflowExecutorBuilder {
    /// Starts a builder over `steps` executed by `step_runner`, controlled
    /// through `bus`.
    #[must_use]
    pub fn new(steps: Vec<WorkflowStep>, step_runner: StepRunner, bus: ControlBus) -> Self {
        Self {
            workflow_id: None,
            steps,
            step_runner,
            bus,
            input: InputProvider::new(),
            state_store: None,
            poll_interval: Duration::from_secs(1),
            transition_hook: None,
        }
    }

    /// Sets the workflow id (default: a fresh UUID).
    #[must_use]
    pub fn workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    /// Uses `input` instead of a fresh provider.
    #[must_use]
    pub fn input_provider(mut self, input: InputProvider) -> Self {
        self.input = input;
        self
    }

    /// Persists executor state through `store`.
    #[must_use]
    pub fn state_store(mut self, store: WorkflowStateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Cadence for polling engine availability in `rate_limit_waiting`.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Installs a transition hook (see [`TransitionHook`]).
    #[must_use]
    pub fn transition_hook(mut self, hook: TransitionHook) -> Self {
        self.transition_hook = Some(hook);
        self
    }

    /// Wires control-bus subscriptions and finalises the executor.
    #[must_use]
    pub fn build(self) -> WorkflowExecutor {
        let flags = Arc::new(ControlFlags::new());
        let cancel = CancellationToken::new();

        let mut subscriptions = self.input.attach(&self.bus);
        subscriptions.extend(wire_bus(&self.bus, &flags, &cancel));

        WorkflowExecutor {
            workflow_id: self
                .workflow_id
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            steps: self.steps,
            step_runner: self.step_runner,
            bus: self.bus,
            input: self.input,
            state_store: self.state_store,
            snapshot: Mutex::new(Snapshot {
                state: ExecutorState::Idle,
                step_index: 0,
                iteration: 0,
            }),
            flags,
            cancel,
            poll_interval: self.poll_interval,
            transition_hook: self.transition_hook,
            tracking: Mutex::new(Vec::new()),
            _subscriptions: subscriptions,
        }
    }
}

impl fmt::Debug for WorkflowExecutorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowExecutorBuilder")
            .field("steps", &self.steps.len())
            .finish()
    }
}

fn wire_bus(
    bus: &ControlBus,
    flags: &Arc<ControlFlags>,
    cancel: &CancellationToken,
) -> Vec<Subscription> {
    let mut subs = Vec::new();

    let f = Arc::clone(flags);
    subs.push(bus.on(EventKind::Pause, move |_| {
        let now_paused = !f.paused.load(Ordering::SeqCst);
        f.paused.store(now_paused, Ordering::SeqCst);
        debug!(paused = now_paused, "pause toggled");
        f.notify.notify_waiters();
    }));

    let f = Arc::clone(flags);
    subs.push(bus.on(EventKind::Skip, move |_| {
        f.skip.store(true, Ordering::SeqCst);
        f.step_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cancel();
        f.notify.notify_waiters();
    }));

    for kind in [EventKind::Stop, EventKind::UserStop] {
        let f = Arc::clone(flags);
        let token = cancel.clone();
        subs.push(bus.on(kind, move |_| {
            f.stop.store(true, Ordering::SeqCst);
            token.cancel();
            f.notify.notify_waiters();
        }));
    }

    let f = Arc::clone(flags);
    subs.push(bus.on(EventKind::Input, move |_| {
        f.checkpoint_resume.store(true, Ordering::SeqCst);
        f.notify.notify_waiters();
    }));

    let f = Arc::clone(flags);
    subs.push(bus.on(EventKind::ModeChange, move |_| {
        f.notify.notify_waiters();
    }));

    subs
}

/// The top-level workflow driver.
pub struct WorkflowExecutor {
    workflow_id: String,
    steps: Vec<WorkflowStep>,
    step_runner: StepRunner,
    bus: ControlBus,
    input: InputProvider,
    state_store: Option<WorkflowStateStore>,
    snapshot: Mutex<Snapshot>,
    flags: Arc<ControlFlags>,
    cancel: CancellationToken,
    poll_interval: Duration,
    transition_hook: Option<TransitionHook>,
    tracking: Mutex<Vec<StepTrack>>,
    _subscriptions: Vec<Subscription>,
}

impl fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("workflow_id", &self.workflow_id)
            .field("steps", &self.steps.len())
            .field("state", &self.state())
            .finish()
    }
}

impl WorkflowExecutor {
    /// The workflow id.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .state
    }

    /// The current `(state, step_index, iteration)` as one consistent read.
    #[must_use]
    pub fn snapshot(&self) -> (ExecutorState, usize, u32) {
        let snap = self
            .snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (snap.state, snap.step_index, snap.iteration)
    }

    /// The workflow-wide cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs the workflow to a terminal state.
    ///
    /// The whole run executes inside a fresh [`TraceContext`] scope, so
    /// every task spawned below inherits the workflow's correlation id.
    ///
    /// [`TraceContext`]: crate::trace::TraceContext
    pub async fn run(&self) -> Result<ExecutorState> {
        let ctx = crate::trace::TraceContext::new()
            .with_attribute("workflow", self.workflow_id.clone())
            .with_tag("workflow-run");
        crate::trace::scope(ctx, self.run_inner()).await
    }

    async fn run_inner(&self) -> Result<ExecutorState> {
        for step in &self.steps {
            step.validate()?;
        }

        info!(workflow = %self.workflow_id, steps = self.steps.len(), "workflow started");
        self.transition(ExecutorState::Running, Some(0))?;
        self.persist().await;

        let mut index = 0usize;
        let mut iterations: HashMap<usize, u32> = HashMap::new();
        let mut loop_skip: HashSet<String> = HashSet::new();
        let mut retry_index: Option<usize> = None;

        while index < self.steps.len() {
            if self.flags.stop.load(Ordering::SeqCst) {
                return self.finish_stopped().await;
            }
            if self.hold_while_paused().await.is_break() {
                return self.finish_stopped().await;
            }
            // A pending UI prompt gates advancement.
            self.input.wait_until_inactive(&self.cancel).await;
            if self.flags.stop.load(Ordering::SeqCst) {
                return self.finish_stopped().await;
            }

            self.transition(ExecutorState::Running, Some(index))?;
            let step = self.steps[index].clone();
            let retrying = retry_index == Some(index);

            let advanced = match step {
                WorkflowStep::Module { agent_id, options } => {
                    if loop_skip.contains(&agent_id) {
                        debug!(agent = %agent_id, index, "step on loop skip-list, skipping");
                        self.track(index, "skipped", None).await;
                        Advance::Next
                    } else {
                        self.run_module(index, &agent_id, options.as_ref(), retrying)
                            .await?
                    }
                }
                WorkflowStep::Parallel { children } => {
                    self.run_parallel(index, &children, retrying).await?
                }
                WorkflowStep::Sequential { children } => {
                    self.run_sequential(index, &children, &loop_skip, retrying)
                        .await?
                }
                WorkflowStep::Loop(spec) => {
                    let count = iterations.entry(index).or_insert(0);
                    *count += 1;
                    let count = *count;
                    self.set_iteration(count);
                    if count >= spec.max_iterations {
                        info!(index, iterations = count, "loop complete");
                        loop_skip.clear();
                        Advance::Next
                    } else {
                        info!(index, iteration = count, back = spec.back_steps, "loop rewind");
                        loop_skip = spec.skip_list.iter().cloned().collect();
                        Advance::To(index.saturating_sub(spec.back_steps))
                    }
                }
                WorkflowStep::UiCheckpoint { reason } => {
                    if self.hold_at_checkpoint(index, &reason).await.is_break() {
                        return self.finish_stopped().await;
                    }
                    Advance::Next
                }
                WorkflowStep::CoordinatorScript { script } => {
                    self.run_script(index, &script).await?
                }
            };

            match advanced {
                Advance::Next => {
                    retry_index = None;
                    index += 1;
                }
                Advance::To(target) => {
                    retry_index = None;
                    index = target;
                }
                Advance::Retry => {
                    retry_index = Some(index);
                    if self.wait_for_available_engine().await.is_break() {
                        return self.finish_stopped().await;
                    }
                }
                Advance::Stopped => return self.finish_stopped().await,
            }
            self.persist().await;
        }

        self.transition(ExecutorState::Completed, None)?;
        self.persist().await;
        info!(workflow = %self.workflow_id, "workflow completed");
        Ok(ExecutorState::Completed)
    }

    async fn run_module(
        &self,
        index: usize,
        agent_id: &str,
        options: Option<&StepOptions>,
        retrying: bool,
    ) -> Result<Advance> {
        self.track(index, "running", None).await;
        let ctx = self.fresh_step_context(retrying);

        match self.step_runner.execute_module(agent_id, options, &ctx).await {
            Ok(outcome) => Ok(self.absorb_outcome(index, outcome).await),
            Err(e) => self.fail_step(index, agent_id, e).await,
        }
    }

    async fn run_parallel(
        &self,
        index: usize,
        children: &[WorkflowStep],
        retrying: bool,
    ) -> Result<Advance> {
        self.track(index, "running", None).await;
        let ctx = self.fresh_step_context(retrying);

        let runs = children.iter().map(|child| {
            let ctx = ctx.clone();
            async move {
                match child {
                    WorkflowStep::Module { agent_id, options } => {
                        self.step_runner
                            .execute_module(agent_id, options.as_ref(), &ctx)
                            .await
                    }
                    // validate() rejects anything else up front
                    other => Err(WorkflowError::InvalidStepType(format!(
                        "parallel child {other:?}"
                    ))
                    .into()),
                }
            }
        });

        let results: Vec<Result<StepOutcome>> = join_all(runs).await;
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => return self.fail_step(index, "parallel", e).await,
            }
        }

        // The group is rate-limited if any child exhausted the candidates.
        if outcomes.iter().any(|o| o.rate_limited) {
            self.track(index, "rate_limited", None).await;
            return Ok(Advance::Retry);
        }
        let ids: Vec<i64> = outcomes.iter().map(|o| o.agent_id).collect();
        let status = if outcomes.iter().any(|o| o.status == AgentStatus::Skipped) {
            self.flags.skip.store(false, Ordering::SeqCst);
            "skipped"
        } else {
            "completed"
        };
        self.track_many(index, status, ids).await;
        Ok(Advance::Next)
    }

    async fn run_sequential(
        &self,
        index: usize,
        children: &[WorkflowStep],
        loop_skip: &HashSet<String>,
        retrying: bool,
    ) -> Result<Advance> {
        self.track(index, "running", None).await;
        for child in children {
            if self.flags.stop.load(Ordering::SeqCst) {
                return Ok(Advance::Stopped);
            }
            match child {
                WorkflowStep::Module { agent_id, options } => {
                    if loop_skip.contains(agent_id) {
                        continue;
                    }
                    let ctx = self.fresh_step_context(retrying);
                    match self
                        .step_runner
                        .execute_module(agent_id, options.as_ref(), &ctx)
                        .await
                    {
                        Ok(outcome) => match self.absorb_outcome(index, outcome).await {
                            Advance::Next => {}
                            other => return Ok(other),
                        },
                        Err(e) => return self.fail_step(index, agent_id, e).await,
                    }
                }
                other => {
                    return Err(WorkflowError::InvalidStepType(format!(
                        "sequential child {other:?}"
                    ))
                    .into());
                }
            }
        }
        self.track(index, "completed", None).await;
        Ok(Advance::Next)
    }

    async fn run_script(&self, index: usize, script: &str) -> Result<Advance> {
        self.track(index, "running", None).await;
        let ctx = self.fresh_step_context(false);
        match self.step_runner.execute_script(script, &ctx).await {
            Ok(_) => {
                self.track(index, "completed", None).await;
                Ok(Advance::Next)
            }
            Err(e) => self.fail_step(index, "coordinator", e).await,
        }
    }

    /// Folds a successful step outcome into tracking and the advance
    /// decision.
    async fn absorb_outcome(&self, index: usize, outcome: StepOutcome) -> Advance {
        if outcome.rate_limited {
            self.track(index, "rate_limited", Some(outcome.agent_id)).await;
            return Advance::Retry;
        }
        match outcome.status {
            AgentStatus::Skipped => {
                self.flags.skip.store(false, Ordering::SeqCst);
                self.track(index, "skipped", Some(outcome.agent_id)).await;
                Advance::Next
            }
            _ => {
                self.track(index, "completed", Some(outcome.agent_id)).await;
                Advance::Next
            }
        }
    }

    /// Fatal step failure: report on the bus, transition to error.
    async fn fail_step(&self, index: usize, agent: &str, e: Error) -> Result<Advance> {
        if matches!(&e, Error::Workflow(WorkflowError::Aborted(_)))
            || self.flags.stop.load(Ordering::SeqCst)
        {
            return Ok(Advance::Stopped);
        }

        error!(index, agent, error = %e, "step failed");
        self.track(index, "failed", None).await;
        self.bus.emit(&ControlEvent::Error {
            error: Some(e.to_string()),
            reason: Some(e.code().to_string()),
            agent_id: None,
        });
        let _ = self.transition(ExecutorState::Error, None);
        self.persist().await;
        Err(WorkflowError::StepExecutionFailed {
            index,
            agent: agent.to_string(),
            message: e.to_string(),
        }
        .into())
    }

    /// A fresh child token for the next step, shared with the skip signal.
    fn fresh_step_context(&self, retrying: bool) -> StepContext {
        let token = self.cancel.child_token();
        *self
            .flags
            .step_cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token.clone();
        StepContext {
            cancel: token,
            skip_requested: Arc::clone(&self.flags.skip),
            retrying,
        }
    }

    /// Blocks while paused. Breaks when a stop arrives instead.
    async fn hold_while_paused(&self) -> Hold {
        if !self.flags.paused.load(Ordering::SeqCst) {
            return Hold::Continue;
        }
        if self.transition(ExecutorState::Paused, None).is_err() {
            return Hold::Continue;
        }
        self.persist().await;
        info!(workflow = %self.workflow_id, "paused");

        while self.flags.paused.load(Ordering::SeqCst) {
            if self.flags.stop.load(Ordering::SeqCst) {
                return Hold::Break;
            }
            let notified = self.flags.notify.notified();
            tokio::select! {
                () = notified => {}
                () = self.cancel.cancelled() => return Hold::Break,
            }
        }
        info!(workflow = %self.workflow_id, "resumed");
        Hold::Continue
    }

    /// Holds at a UI checkpoint until resumed (or auto-continues in
    /// autonomous mode). Breaks on stop.
    async fn hold_at_checkpoint(&self, index: usize, reason: &str) -> Hold {
        if self.input.autonomous_mode() {
            info!(index, reason, "checkpoint auto-continued (autonomous mode)");
            self.track(index, "completed", None).await;
            return Hold::Continue;
        }

        // The checkpoint is visible in the monitor like any agent.
        let record_id = match self
            .step_runner
            .monitor()
            .register(NewAgent::new("ui-checkpoint", "ui").with_prompt(reason))
            .await
        {
            Ok(id) => {
                let _ = self
                    .step_runner
                    .monitor()
                    .set_status(id, AgentStatus::Checkpoint)
                    .await;
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "failed to register checkpoint record");
                None
            }
        };

        if self.transition(ExecutorState::Checkpoint, Some(index)).is_err() {
            return Hold::Continue;
        }
        self.persist().await;
        self.track(index, "checkpoint", record_id).await;
        info!(index, reason, "holding at checkpoint");
        self.flags.checkpoint_resume.store(false, Ordering::SeqCst);

        loop {
            if self.flags.stop.load(Ordering::SeqCst) {
                return Hold::Break;
            }
            if self.flags.checkpoint_resume.swap(false, Ordering::SeqCst)
                || self.input.autonomous_mode()
            {
                break;
            }
            let notified = self.flags.notify.notified();
            tokio::select! {
                () = notified => {}
                () = self.cancel.cancelled() => return Hold::Break,
            }
        }

        if let Some(id) = record_id {
            let monitor = self.step_runner.monitor();
            let _ = monitor.set_status(id, AgentStatus::Running).await;
            let _ = monitor.mark_completed(id, None).await;
        }
        let _ = self.transition(ExecutorState::Running, None);
        self.track(index, "completed", record_id).await;
        info!(index, "checkpoint resumed");
        Hold::Continue
    }

    /// Parks in `rate_limit_waiting` until any engine is available again.
    async fn wait_for_available_engine(&self) -> Hold {
        if self.transition(ExecutorState::RateLimitWaiting, None).is_err() {
            return Hold::Continue;
        }
        self.persist().await;
        warn!(workflow = %self.workflow_id, "all engines rate limited, waiting");

        loop {
            if self.flags.stop.load(Ordering::SeqCst) {
                return Hold::Break;
            }

            let rate_limits = self.step_runner.fallback_runner().rate_limits();
            for id in self.step_runner.fallback_runner().registry().ids() {
                if rate_limits.is_engine_available(&id).await {
                    info!(engine = %id, "engine available again, resuming");
                    let _ = self.transition(ExecutorState::Running, None);
                    return Hold::Continue;
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = self.cancel.cancelled() => return Hold::Break,
            }
        }
    }

    async fn finish_stopped(&self) -> Result<ExecutorState> {
        self.bus.emit(&ControlEvent::Stopping);
        let _ = self.transition(ExecutorState::Stopping, None);
        self.cancel.cancel();
        let _ = self.transition(ExecutorState::Stopped, None);
        self.persist().await;
        info!(workflow = %self.workflow_id, "workflow stopped");
        Ok(ExecutorState::Stopped)
    }

    /// Commits `(state, index)` atomically, running the transition hook
    /// first; a hook failure leaves the snapshot untouched and is reported
    /// on the bus.
    fn transition(&self, state: ExecutorState, index: Option<usize>) -> Result<()> {
        let mut snap = self
            .snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next_index = index.unwrap_or(snap.step_index);

        if let Some(hook) = &self.transition_hook {
            if let Err(e) = hook(state, next_index) {
                drop(snap);
                warn!(state = %state, error = %e, "transition rejected by hook");
                self.bus.emit(&ControlEvent::Error {
                    error: Some(e.to_string()),
                    reason: Some("transition rejected".to_string()),
                    agent_id: None,
                });
                return Err(e);
            }
        }

        snap.state = state;
        snap.step_index = next_index;
        Ok(())
    }

    fn set_iteration(&self, iteration: u32) {
        let mut snap = self
            .snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        snap.iteration = iteration;
    }

    async fn track(&self, index: usize, status: &str, agent_id: Option<i64>) {
        self.track_many(index, status, agent_id.into_iter().collect())
            .await;
    }

    async fn track_many(&self, index: usize, status: &str, agent_ids: Vec<i64>) {
        {
            let mut tracking = self
                .tracking
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match tracking.iter_mut().find(|t| t.index == index) {
                Some(entry) => {
                    entry.status = status.to_string();
                    for id in agent_ids {
                        if !entry.agent_ids.contains(&id) {
                            entry.agent_ids.push(id);
                        }
                    }
                }
                None => tracking.push(StepTrack {
                    index,
                    status: status.to_string(),
                    agent_ids,
                }),
            }
        }
        self.persist_tracking().await;
    }

    /// Best-effort persistence; state files are advisory post-mortem data.
    async fn persist(&self) {
        let Some(store) = &self.state_store else { return };
        let (state, step_index, iteration) = self.snapshot();
        let controller = ControllerState {
            workflow_id: self.workflow_id.clone(),
            state: state.as_str().to_string(),
            step_index,
            iteration,
            updated_at: Utc::now(),
        };
        if let Err(e) = store.save_controller(&controller).await {
            warn!(error = %e, "failed to persist controller state");
        }
    }

    async fn persist_tracking(&self) {
        let Some(store) = &self.state_store else { return };
        let tracking = {
            self.tracking
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        };
        if let Err(e) = store.save_tracking(&tracking).await {
            warn!(error = %e, "failed to persist tracking state");
        }
    }
}

/// Where the main loop goes after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    /// Move to the next step.
    Next,
    /// Jump to an index (loop rewind).
    To(usize),
    /// Re-execute the same step once an engine is available.
    Retry,
    /// A stop arrived mid-step.
    Stopped,
}

/// Outcome of a hold (pause / checkpoint / rate-limit wait).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Continue,
    Break,
}

impl Hold {
    const fn is_break(self) -> bool {
        matches!(self, Self::Break)
    }
}
