//! Typed pub/sub for workflow control signals.
//!
//! The [`ControlBus`] carries external control — pause, skip, stop, user
//! input, mode changes — from the UI (or OS signals) into the workflow
//! executor and the input provider. Delivery is synchronous on the
//! emitter's thread, in emission order; handlers must not block.
//!
//! Subscribing returns a [`Subscription`] handle; dropping it does nothing,
//! unsubscribing twice is a no-op. Listener counts are tracked per event
//! kind and a warning is logged past [`MAX_LISTENERS`] to surface leaks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Soft cap on listeners per event kind; exceeding it logs a leak warning.
pub const MAX_LISTENERS: usize = 50;

/// A control signal with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControlEvent {
    /// Toggle pause: first emission pauses step advancement, the next
    /// resumes it.
    Pause,
    /// Complete the current step as skipped and advance.
    Skip,
    /// Stop the workflow.
    Stop,
    /// The executor acknowledged a stop and is winding down.
    Stopping,
    /// The autonomous-mode flag flipped.
    ModeChange {
        /// `true`: auto-continue on UI checkpoints; `false`: pause at each.
        autonomous_mode: bool,
    },
    /// User input arrived for a pending prompt or checkpoint.
    Input {
        /// The user's prompt text, when they provided one.
        prompt: Option<String>,
        /// The user chose to skip instead of answering.
        skip: bool,
    },
    /// A failure surfaced to the UI.
    Error {
        /// Error text.
        error: Option<String>,
        /// Stable error code or free-form reason.
        reason: Option<String>,
        /// The agent the failure belongs to, when known.
        agent_id: Option<i64>,
    },
    /// The user requested an immediate stop (distinct from programmatic
    /// [`ControlEvent::Stop`]).
    UserStop,
}

/// The kind of a [`ControlEvent`], used as subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    /// [`ControlEvent::Pause`]
    Pause,
    /// [`ControlEvent::Skip`]
    Skip,
    /// [`ControlEvent::Stop`]
    Stop,
    /// [`ControlEvent::Stopping`]
    Stopping,
    /// [`ControlEvent::ModeChange`]
    ModeChange,
    /// [`ControlEvent::Input`]
    Input,
    /// [`ControlEvent::Error`]
    Error,
    /// [`ControlEvent::UserStop`]
    UserStop,
}

impl ControlEvent {
    /// The subscription key this event is delivered under.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Pause => EventKind::Pause,
            Self::Skip => EventKind::Skip,
            Self::Stop => EventKind::Stop,
            Self::Stopping => EventKind::Stopping,
            Self::ModeChange { .. } => EventKind::ModeChange,
            Self::Input { .. } => EventKind::Input,
            Self::Error { .. } => EventKind::Error,
            Self::UserStop => EventKind::UserStop,
        }
    }
}

type Handler = Arc<dyn Fn(&ControlEvent) + Send + Sync + 'static>;

struct Listener {
    id: u64,
    handler: Handler,
}

type Registry = Arc<Mutex<HashMap<EventKind, Vec<Listener>>>>;

/// Process-scoped control signal bus. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ControlBus {
    registry: Registry,
    next_id: Arc<AtomicU64>,
}

impl ControlBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to events of `kind`.
    ///
    /// Handlers run synchronously on the emitting thread, in subscription
    /// order. The returned [`Subscription`] removes the handler; calling
    /// [`Subscription::unsubscribe`] more than once is harmless.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ControlEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let listeners = registry.entry(kind).or_default();
        listeners.push(Listener {
            id,
            handler: Arc::new(handler),
        });

        if listeners.len() > MAX_LISTENERS {
            warn!(
                kind = ?kind,
                count = listeners.len(),
                "listener count exceeds threshold, possible leak"
            );
        }

        Subscription {
            registry: Arc::clone(&self.registry),
            kind,
            id,
        }
    }

    /// Delivers `event` to every listener of its kind, in emission order.
    pub fn emit(&self, event: &ControlEvent) {
        // Handlers are invoked outside the lock so they may themselves
        // subscribe or unsubscribe.
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            registry
                .get(&event.kind())
                .map(|ls| ls.iter().map(|l| Arc::clone(&l.handler)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of live listeners for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        let registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.get(&kind).map_or(0, Vec::len)
    }

    /// Removes every listener. Intended for tests.
    pub fn reset(&self) {
        let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.clear();
    }
}

impl fmt::Debug for ControlBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let total: usize = registry.values().map(Vec::len).sum();
        f.debug_struct("ControlBus")
            .field("listeners", &total)
            .finish()
    }
}

/// Handle returned by [`ControlBus::on`]; removes the listener on demand.
#[derive(Clone)]
pub struct Subscription {
    registry: Registry,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Removes the listener. Idempotent.
    pub fn unsubscribe(&self) {
        let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(listeners) = registry.get_mut(&self.kind) {
            listeners.retain(|l| l.id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_to_matching_kind_only() {
        let bus = ControlBus::new();
        let pauses = Arc::new(AtomicUsize::new(0));
        let skips = Arc::new(AtomicUsize::new(0));

        let p = Arc::clone(&pauses);
        let _sub_p = bus.on(EventKind::Pause, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&skips);
        let _sub_s = bus.on(EventKind::Skip, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&ControlEvent::Pause);
        bus.emit(&ControlEvent::Pause);
        bus.emit(&ControlEvent::Skip);

        assert_eq!(pauses.load(Ordering::SeqCst), 2);
        assert_eq!(skips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let bus = ControlBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let o = Arc::clone(&order);
            let _ = bus.on(EventKind::Stop, move |_| {
                o.lock().unwrap().push(tag);
            });
        }

        bus.emit(&ControlEvent::Stop);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = ControlBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.on(EventKind::UserStop, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.listener_count(EventKind::UserStop), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.listener_count(EventKind::UserStop), 0);

        bus.emit(&ControlEvent::UserStop);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn payloads_reach_handlers() {
        let bus = ControlBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let _sub = bus.on(EventKind::Input, move |e| {
            *s.lock().unwrap() = Some(e.clone());
        });

        bus.emit(&ControlEvent::Input {
            prompt: Some("continue with plan B".into()),
            skip: false,
        });

        match seen.lock().unwrap().take().unwrap() {
            ControlEvent::Input { prompt, skip } => {
                assert_eq!(prompt.as_deref(), Some("continue with plan B"));
                assert!(!skip);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn reset_clears_all_listeners() {
        let bus = ControlBus::new();
        let _a = bus.on(EventKind::Pause, |_| {});
        let _b = bus.on(EventKind::Error, |_| {});
        assert_eq!(bus.listener_count(EventKind::Pause), 1);

        bus.reset();
        assert_eq!(bus.listener_count(EventKind::Pause), 0);
        assert_eq!(bus.listener_count(EventKind::Error), 0);
    }

    #[test]
    fn handler_may_unsubscribe_during_emit() {
        let bus = ControlBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let h = Arc::clone(&hits);
        let s = Arc::clone(&slot);
        let sub = bus.on(EventKind::Stop, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = s.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        bus.emit(&ControlEvent::Stop);
        bus.emit(&ControlEvent::Stop);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
