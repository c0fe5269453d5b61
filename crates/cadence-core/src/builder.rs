//! Fluent builders producing configured triggers and jobs.
//!
//! Builders collect settings, apply configuration defaults and validate once
//! at [`TriggerBuilder::build`] / [`JobBuilder::build`]. The objects they
//! produce hold an immutable configuration plus runtime counters.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{JobDefaults, TriggerDefaults};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::job::{job_action, JobAction, JobHandler, JobWork, ScheduledJob};
use crate::schedule::Schedule;
use crate::trigger::{fire_action, FireAction, TimerTrigger, TriggerConfig};

/// Builder for [`TimerTrigger`]
#[derive(Default)]
pub struct TriggerBuilder {
    name: String,
    group: Option<String>,
    schedule: Option<Schedule>,
    fire_action: Option<FireAction>,
    max_concurrents: Option<usize>,
    max_occurrences: Option<u64>,
    rate_limit: Option<Duration>,
}

impl TriggerBuilder {
    /// Start building a trigger called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Apply configured defaults. Settings made on the builder win.
    #[must_use]
    pub fn with_defaults(mut self, defaults: &TriggerDefaults) -> Self {
        self.max_concurrents.get_or_insert(defaults.max_concurrents);
        if self.max_occurrences.is_none() {
            self.max_occurrences = defaults.max_occurrences;
        }
        if self.rate_limit.is_none() {
            self.rate_limit = defaults.rate_limit();
        }
        self
    }

    /// Set the group
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Tick at a fixed interval
    #[must_use]
    pub fn every(self, interval: Duration) -> Self {
        self.schedule(Schedule::every(interval))
    }

    /// Tick on an arbitrary schedule
    #[must_use]
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Set the fire action from an async closure
    #[must_use]
    pub fn fire_action<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<ExecutionContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.fire_action = Some(fire_action(f));
        self
    }

    /// Set an already wrapped fire action
    #[must_use]
    pub fn fire_action_arc(mut self, action: FireAction) -> Self {
        self.fire_action = Some(action);
        self
    }

    /// Concurrency ceiling for fire actions
    #[must_use]
    pub fn max_concurrents(mut self, max: usize) -> Self {
        self.max_concurrents = Some(max);
        self
    }

    /// Occurrence budget
    #[must_use]
    pub fn max_occurrences(mut self, max: u64) -> Self {
        self.max_occurrences = Some(max);
        self
    }

    /// Minimum tick spacing together with the concurrency ceiling
    #[must_use]
    pub fn rate_limit(mut self, spacing: Duration, max_concurrents: usize) -> Self {
        self.rate_limit = Some(spacing);
        self.max_concurrents = Some(max_concurrents);
        self
    }

    /// Validate and produce a configured trigger
    pub fn build(self) -> Result<TimerTrigger> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("name", "trigger name is empty"));
        }
        let action = self
            .fire_action
            .ok_or_else(|| Error::invalid_config("fire_action", "no fire action defined"))?;
        let schedule = self
            .schedule
            .ok_or_else(|| Error::invalid_config("schedule", "no schedule defined"))?;

        let config = TriggerConfig::new(action, schedule)
            .with_max_concurrents(self.max_concurrents.unwrap_or(1))
            .with_max_occurrences(self.max_occurrences)
            .with_rate_limit(self.rate_limit);

        let trigger = TimerTrigger::with_group(self.name, self.group);
        trigger.configure(config)?;
        Ok(trigger)
    }
}

/// Builder for [`ScheduledJob`]
pub struct JobBuilder {
    name: String,
    group: Option<String>,
    action: Option<JobAction>,
    handler: Option<Arc<dyn JobHandler>>,
    max_concurrents: Option<usize>,
    rate_limit: Option<Duration>,
    enabled: bool,
}

impl JobBuilder {
    /// Start building a job called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            action: None,
            handler: None,
            max_concurrents: None,
            rate_limit: None,
            enabled: true,
        }
    }

    /// Apply configured defaults. Settings made on the builder win.
    #[must_use]
    pub fn with_defaults(mut self, defaults: &JobDefaults) -> Self {
        if self.max_concurrents.is_none() {
            self.max_concurrents = Some(defaults.max_concurrents);
            if self.rate_limit.is_none() {
                self.rate_limit = defaults.rate_limit();
            }
        }
        self
    }

    /// Set the group
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Run an async closure on each execution
    #[must_use]
    pub fn action<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<ExecutionContext>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.action = Some(job_action(f));
        self
    }

    /// Run a [`JobHandler`] on each execution
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Concurrency ceiling. Clears any rate limit set earlier.
    #[must_use]
    pub fn max_concurrents(mut self, max: usize) -> Self {
        self.max_concurrents = Some(max);
        self.rate_limit = None;
        self
    }

    /// Minimum spacing between executions together with the concurrency
    /// ceiling
    #[must_use]
    pub fn rate_limit(mut self, spacing: Duration, max_concurrents: usize) -> Self {
        self.rate_limit = Some(spacing);
        self.max_concurrents = Some(max_concurrents);
        self
    }

    /// Initial enabled flag
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validate and produce a configured job
    pub fn build(self) -> Result<ScheduledJob> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("name", "job name is empty"));
        }
        let work = match (self.action, self.handler) {
            (Some(action), None) => JobWork::Action(action),
            (None, Some(handler)) => JobWork::Handler(handler),
            (Some(_), Some(_)) => {
                return Err(Error::invalid_config(
                    "action",
                    "both an action and a handler are defined",
                ))
            }
            (None, None) => {
                return Err(Error::invalid_config(
                    "action",
                    "no action or handler defined",
                ))
            }
        };

        let job = ScheduledJob::new(self.name, work)
            .with_group(self.group)
            .with_rate_limit(self.rate_limit)
            .with_max_concurrents(self.max_concurrents.unwrap_or(1))?;
        job.set_enabled(self.enabled);
        Ok(job)
    }
}
