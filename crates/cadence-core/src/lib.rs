//! Cadence Core - In-process Scheduling Engine
//!
//! This crate provides the scheduling core of Cadence, including:
//! - Triggers: self-rescheduling timer loops with concurrency, occurrence
//!   and rate limits
//! - Jobs: units of work with their own concurrency ceiling and rate limit
//! - Orchestrator: wires triggers to jobs and aggregates lifecycle events
//! - Events: isolated listener registries and a broadcast event bus
//! - Builders and configuration defaults

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod rate_limiter;
pub mod schedule;
pub mod trigger;

pub use builder::{JobBuilder, TriggerBuilder};
pub use config::{JobDefaults, SchedulerConfig, TriggerDefaults};
pub use context::{ContextBuilder, ExecutionContext};
pub use error::{Error, Result};
pub use event_bus::{EventBus, SchedulerEvent};
pub use events::{listener, EventKind, EventSource, LifecycleEvent, Listener, SubscriptionId};
pub use job::{
    job_action, ExecutionOutcome, Job, JobAction, JobFuture, JobHandler, JobWork, ScheduledJob,
};
pub use orchestrator::{Orchestrator, OrchestratorStats};
pub use rate_limiter::RateLimiter;
pub use schedule::Schedule;
pub use trigger::{
    fire_action, FireAction, FireFuture, TimerTrigger, Trigger, TriggerConfig, TriggerState,
};
