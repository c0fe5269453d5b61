//! EventBus - broadcast stream of aggregated scheduler events.
//!
//! The orchestrator publishes a serializable summary of every lifecycle event
//! it re-raises, so log shippers and other async consumers can follow the
//! scheduler without registering synchronous listeners.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::context::ExecutionContext;
use crate::events::{EventKind, LifecycleEvent};

/// Events published on the bus.
///
/// `source` is the display form of the emitting component
/// (`trigger:<name>`, `job:<name>` or `orchestrator`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A trigger's fire action returned `true`
    Triggered {
        /// Emitting component
        source: String,
        /// Activation context
        context: Option<ExecutionContext>,
        /// When the orchestrator observed the event
        at: DateTime<Utc>,
    },
    /// A fire action, job or listener failed
    Faulted {
        /// Emitting component
        source: String,
        /// Error description
        error: String,
        /// Context of the failed execution, if any
        context: Option<ExecutionContext>,
        /// When the orchestrator observed the event
        at: DateTime<Utc>,
    },
    /// A trigger was cancelled through its token
    Canceled {
        /// Emitting component
        source: String,
        /// When the orchestrator observed the event
        at: DateTime<Utc>,
    },
    /// A trigger completed
    Completed {
        /// Emitting component
        source: String,
        /// When the orchestrator observed the event
        at: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    /// Summarize a lifecycle event, stamped with the current time
    #[must_use]
    pub fn from_lifecycle(event: &LifecycleEvent) -> Self {
        let source = event.source.to_string();
        let at = Utc::now();
        match &event.kind {
            EventKind::Triggered => Self::Triggered {
                source,
                context: event.context.clone(),
                at,
            },
            EventKind::Faulted(error) => Self::Faulted {
                source,
                error: error.to_string(),
                context: event.context.clone(),
                at,
            },
            EventKind::Canceled => Self::Canceled { source, at },
            EventKind::Completed => Self::Completed { source, at },
        }
    }

    /// Emitting component
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Triggered { source, .. }
            | Self::Faulted { source, .. }
            | Self::Canceled { source, .. }
            | Self::Completed { source, .. } => source,
        }
    }

    /// Observation time
    #[must_use]
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Triggered { at, .. }
            | Self::Faulted { at, .. }
            | Self::Canceled { at, .. }
            | Self::Completed { at, .. } => *at,
        }
    }
}

/// Broadcast-based event bus.
///
/// Slow subscribers miss events (lagged) rather than blocking the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of receivers
    pub fn publish(&self, event: SchedulerEvent) -> usize {
        // send() fails only when nobody is listening
        self.sender.send(event).unwrap_or(0)
    }

    /// Current number of receivers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::events::EventSource;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let context = ExecutionContext::builder().insert("k", "v").build();
        bus.publish(SchedulerEvent::from_lifecycle(&LifecycleEvent::triggered(
            EventSource::Trigger("nightly".to_string()),
            Some(context.clone()),
        )));

        match rx.recv().await.unwrap() {
            SchedulerEvent::Triggered {
                source,
                context: received,
                ..
            } => {
                assert_eq!(source, "trigger:nightly");
                assert_eq!(received, Some(context));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let count = bus.publish(SchedulerEvent::from_lifecycle(&LifecycleEvent::completed(
            EventSource::Trigger("t".to_string()),
        )));
        assert_eq!(count, 2);

        assert_eq!(rx1.recv().await.unwrap().source(), "trigger:t");
        assert_eq!(rx2.recv().await.unwrap().source(), "trigger:t");
    }

    #[test]
    fn test_publish_no_subscribers() {
        let bus = EventBus::default();
        let count = bus.publish(SchedulerEvent::from_lifecycle(&LifecycleEvent::canceled(
            EventSource::Orchestrator,
        )));
        assert_eq!(count, 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = SchedulerEvent::from_lifecycle(&LifecycleEvent::faulted(
            EventSource::Job("report".to_string()),
            None,
            Error::Execution {
                job: "report".to_string(),
                message: "disk full".to_string(),
            },
        ));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "faulted");
        assert_eq!(json["source"], "job:report");
        assert_eq!(json["error"], "job report failed: disk full");
        assert!(json["context"].is_null());
        assert!(json["at"].is_string());
    }
}
