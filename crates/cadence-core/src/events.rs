//! Lifecycle events and the listener registry shared by triggers, jobs and
//! the orchestrator.
//!
//! Every listener call is isolated: an `Err` return or a panic is caught,
//! logged and reported back to the emitter, and the remaining listeners of
//! the same event still run. What the emitter does with those failures is
//! its own policy (triggers and the orchestrator turn them into a single
//! `Faulted` event unless the failing event was itself a fault).

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::{panic_message, Error};

/// Component that raised an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum EventSource {
    /// A trigger, by name
    Trigger(String),
    /// A job, by name
    Job(String),
    /// The orchestrator itself
    Orchestrator,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trigger(name) => write!(f, "trigger:{}", name),
            Self::Job(name) => write!(f, "job:{}", name),
            Self::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

/// What happened
#[derive(Debug, Clone)]
pub enum EventKind {
    /// The fire action returned `true`
    Triggered,
    /// A fire action, job execution or listener failed
    Faulted(Arc<Error>),
    /// The activation token was cancelled
    Canceled,
    /// The component stopped on its own (occurrence budget or deactivation)
    Completed,
}

impl EventKind {
    /// Stable lowercase label used in logs and serialized events
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Faulted(_) => "faulted",
            Self::Canceled => "canceled",
            Self::Completed => "completed",
        }
    }
}

/// Event delivered to listeners
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// Who raised the event
    pub source: EventSource,
    /// Context of the activation, `None` for terminal and trigger fault events
    pub context: Option<ExecutionContext>,
    /// Event payload
    pub kind: EventKind,
}

impl LifecycleEvent {
    /// A `Triggered` event
    pub fn triggered(source: EventSource, context: Option<ExecutionContext>) -> Self {
        Self {
            source,
            context,
            kind: EventKind::Triggered,
        }
    }

    /// A `Faulted` event
    pub fn faulted(source: EventSource, context: Option<ExecutionContext>, error: Error) -> Self {
        Self {
            source,
            context,
            kind: EventKind::Faulted(Arc::new(error)),
        }
    }

    /// A `Canceled` event (always without context)
    pub fn canceled(source: EventSource) -> Self {
        Self {
            source,
            context: None,
            kind: EventKind::Canceled,
        }
    }

    /// A `Completed` event (always without context)
    pub fn completed(source: EventSource) -> Self {
        Self {
            source,
            context: None,
            kind: EventKind::Completed,
        }
    }

    /// Whether this is a `Faulted` event
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self.kind, EventKind::Faulted(_))
    }

    /// The error carried by a `Faulted` event
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match &self.kind {
            EventKind::Faulted(error) => Some(error),
            _ => None,
        }
    }
}

/// Callback registered on a component.
pub type Listener = Arc<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure into a [`Listener`]
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Raw id value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SubscriptionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Ordered listener registry.
#[derive(Default)]
pub struct Observers {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("listeners", &self.len())
            .finish()
    }
}

impl Observers {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; listeners are invoked in registration order
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listener is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener and collect the failures.
    ///
    /// The registry is snapshotted first, so listeners may subscribe or
    /// unsubscribe from inside a callback.
    pub fn notify(&self, event: &LifecycleEvent) -> Vec<String> {
        self.notify_gated(event, |deliver| {
            deliver();
            true
        })
    }

    /// Like [`notify`](Self::notify), but every single delivery goes through
    /// `gate`. The gate either runs the delivery and returns `true`, or
    /// returns `false` to stop delivering to the remaining listeners.
    pub(crate) fn notify_gated<G>(&self, event: &LifecycleEvent, gate: G) -> Vec<String>
    where
        G: Fn(&mut dyn FnMut()) -> bool,
    {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut failures = Vec::new();
        for listener in snapshot {
            let mut outcome = None;
            let delivered = gate(&mut || {
                outcome = Some(catch_unwind(AssertUnwindSafe(|| listener(event))));
            });
            if !delivered {
                break;
            }
            let failure = match outcome {
                None | Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => format!("{:#}", e),
                Some(Err(payload)) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(
                source = %event.source,
                event = event.kind.label(),
                error = %failure,
                "Event listener failed"
            );
            failures.push(failure);
        }
        failures
    }
}

/// Build the single `Faulted` event that reports listener failures of a
/// non-fault event.
pub(crate) fn subscriber_fault(source: EventSource, failures: Vec<String>) -> LifecycleEvent {
    LifecycleEvent::faulted(source, None, Error::Subscriber(failures.join("; ")))
}
