//! The input provider: queued user prompts and the checkpoint gate.
//!
//! The UI asks the user to complete pending prompts; while a prompt is
//! *active* the executor must not advance past the current step. Mode
//! changes flip between autonomous (auto-continue on UI checkpoints) and
//! interactive (pause at every checkpoint).
//!
//! Activation and deactivation failures are caught and logged by callers;
//! they never abort the workflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{ControlBus, ControlEvent, EventKind, Subscription};
use crate::error::{Result, ValidationError};

#[derive(Debug, Default)]
struct InputState {
    queue: VecDeque<String>,
    active: Option<String>,
}

/// Queue of pending user prompts plus the step-advancement gate.
#[derive(Debug, Clone, Default)]
pub struct InputProvider {
    state: Arc<Mutex<InputState>>,
    autonomous: Arc<AtomicBool>,
    changed: Arc<Notify>,
}

impl InputProvider {
    /// A provider with an empty queue, in interactive mode.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a prompt as awaiting the user, blocking step advancement.
    ///
    /// `monitoring_id` names the prompt for the UI. Activating while
    /// another prompt is active is an error the caller logs and ignores.
    pub fn activate(&self, monitoring_id: impl Into<String>) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = monitoring_id.into();
        if let Some(active) = &state.active {
            return Err(ValidationError::InvalidField {
                field: "monitoring_id".to_string(),
                message: format!("prompt '{active}' is already active, cannot activate '{id}'"),
            }
            .into());
        }
        debug!(monitoring_id = %id, "input prompt activated");
        state.active = Some(id);
        Ok(())
    }

    /// Releases the gate. Deactivating with nothing active is an error the
    /// caller logs and ignores.
    pub fn deactivate(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.active.take().is_none() {
            return Err(ValidationError::InvalidField {
                field: "monitoring_id".to_string(),
                message: "no prompt is active".to_string(),
            }
            .into());
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Whether a prompt is currently awaiting the user.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .active
            .is_some()
    }

    /// Appends a prompt to the queue.
    pub fn enqueue(&self, prompt: impl Into<String>) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.queue.push_back(prompt.into());
        drop(state);
        self.changed.notify_waiters();
    }

    /// The prompt at the head of the queue, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .queue
            .front()
            .cloned()
    }

    /// Removes and returns the prompt at the head of the queue.
    pub fn advance(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .queue
            .pop_front()
    }

    /// Whether checkpoints auto-continue.
    #[must_use]
    pub fn autonomous_mode(&self) -> bool {
        self.autonomous.load(Ordering::SeqCst)
    }

    /// Flips autonomous mode.
    pub fn set_autonomous_mode(&self, autonomous: bool) {
        self.autonomous.store(autonomous, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Blocks until no prompt is active (or `cancel` fires).
    pub async fn wait_until_inactive(&self, cancel: &CancellationToken) {
        loop {
            // Arm the notifier before checking, so a deactivate between
            // check and await is not missed.
            let notified = self.changed.notified();
            if !self.is_active() || cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                () = notified => {}
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Wires the provider to the control bus: `input` events feed the
    /// queue, `mode-change` events flip autonomous mode. The returned
    /// subscriptions keep the wiring alive.
    #[must_use]
    pub fn attach(&self, bus: &ControlBus) -> Vec<Subscription> {
        let this = self.clone();
        let on_input = bus.on(EventKind::Input, move |event| {
            if let ControlEvent::Input { prompt, skip } = event {
                if let Some(prompt) = prompt {
                    this.enqueue(prompt.clone());
                }
                if *skip {
                    if let Err(e) = this.deactivate() {
                        warn!(error = %e, "input skip without an active prompt");
                    }
                }
            }
        });

        let this = self.clone();
        let on_mode = bus.on(EventKind::ModeChange, move |event| {
            if let ControlEvent::ModeChange { autonomous_mode } = event {
                this.set_autonomous_mode(*autonomous_mode);
            }
        });

        vec![on_input, on_mode]
    }
}
