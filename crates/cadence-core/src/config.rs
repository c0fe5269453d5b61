//! Scheduler defaults
//!
//! Every field has a serde default so a partial TOML table (or none at all)
//! deserializes into a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default capacity of the orchestrator's broadcast event bus
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Top-level scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Defaults applied to triggers built from this configuration
    #[serde(default)]
    pub trigger: TriggerDefaults,
    /// Defaults applied to jobs built from this configuration
    #[serde(default)]
    pub job: JobDefaults,
    /// Broadcast channel capacity for aggregated events
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerDefaults::default(),
            job: JobDefaults::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Set the event bus capacity
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set trigger defaults
    #[must_use]
    pub fn with_trigger_defaults(mut self, defaults: TriggerDefaults) -> Self {
        self.trigger = defaults;
        self
    }

    /// Set job defaults
    #[must_use]
    pub fn with_job_defaults(mut self, defaults: JobDefaults) -> Self {
        self.job = defaults;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::invalid_config(
                "event_capacity",
                "must be at least 1",
            ));
        }
        self.trigger.validate()?;
        self.job.validate()
    }
}

/// Trigger defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefaults {
    /// Concurrent fire actions per trigger
    #[serde(default = "default_max_concurrents")]
    pub max_concurrents: usize,
    /// Occurrence budget, unbounded when absent
    #[serde(default)]
    pub max_occurrences: Option<u64>,
    /// Minimum spacing between ticks in milliseconds
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
}

impl Default for TriggerDefaults {
    fn default() -> Self {
        Self {
            max_concurrents: default_max_concurrents(),
            max_occurrences: None,
            rate_limit_ms: None,
        }
    }
}

impl TriggerDefaults {
    /// Rate limit as a duration
    #[must_use]
    pub fn rate_limit(&self) -> Option<Duration> {
        self.rate_limit_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrents == 0 {
            return Err(Error::invalid_config(
                "trigger.max_concurrents",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Job defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    /// Concurrent executions per job
    #[serde(default = "default_max_concurrents")]
    pub max_concurrents: usize,
    /// Minimum spacing between executions in milliseconds
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_concurrents: default_max_concurrents(),
            rate_limit_ms: None,
        }
    }
}

impl JobDefaults {
    /// Rate limit as a duration
    #[must_use]
    pub fn rate_limit(&self) -> Option<Duration> {
        self.rate_limit_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrents == 0 {
            return Err(Error::invalid_config(
                "job.max_concurrents",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_max_concurrents() -> usize {
    1
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}
