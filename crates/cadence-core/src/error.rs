//! Error types for cadence-core
//!
//! Configuration errors are returned synchronously from the call that
//! configures or starts a component. Faults raised while a trigger or job is
//! running never cross the task boundary; they travel inside
//! [`EventKind::Faulted`](crate::events::EventKind::Faulted) events instead.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range or missing
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// The trigger was activated before a fire action and schedule were set
    #[error("trigger is not configured")]
    NotConfigured,

    /// The trigger configuration can only be set once
    #[error("trigger is already configured")]
    AlreadyConfigured,

    /// The trigger loop is already running or has terminated
    #[error("trigger has already been activated")]
    AlreadyActive,

    /// The orchestrator was started twice, or modified after start
    #[error("orchestrator has already been started")]
    AlreadyStarted,

    /// Start was requested without any registered job
    #[error("orchestrator has no jobs")]
    NoJobs,

    /// Start was requested without any registered trigger
    #[error("orchestrator has no triggers")]
    NoTriggers,

    /// Activation was requested outside of a tokio runtime
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The fire action of a trigger failed
    #[error("fire action failed: {0}")]
    FireAction(String),

    /// A job execution failed
    #[error("job {job} failed: {message}")]
    Execution {
        /// Job name
        job: String,
        /// Failure description, including the source chain
        message: String,
    },

    /// A job was invoked while all of its execution slots were busy
    #[error("job {job} is at capacity ({max} concurrent executions)")]
    CapacityExceeded {
        /// Job name
        job: String,
        /// Concurrency ceiling in effect
        max: usize,
    },

    /// An event listener returned an error or panicked
    #[error("event listener failed: {0}")]
    Subscriber(String),

    /// User code panicked
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for [`Error::InvalidConfig`]
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error was raised by configuration or startup, as opposed
    /// to a runtime fault.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::NotConfigured
                | Error::AlreadyConfigured
                | Error::AlreadyActive
                | Error::AlreadyStarted
                | Error::NoJobs
                | Error::NoTriggers
                | Error::NoRuntime
        )
    }

    /// Hint printed by the CLI next to a configuration error
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::InvalidConfig { .. } => {
                Some("Check the value in config/default.toml or the CADENCE_* environment.")
            }
            Error::NoJobs => Some("Declare at least one [[jobs]] entry."),
            Error::NoTriggers => Some("Declare at least one [[triggers]] entry."),
            Error::NoRuntime => Some("Call start() from inside a tokio runtime."),
            _ => None,
        }
    }
}

/// Render a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
