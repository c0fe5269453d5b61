//! Job execution wrapper
//!
//! A [`ScheduledJob`] wraps a unit of work (an async closure or a
//! [`JobHandler`] implementation) with its own concurrency ceiling and
//! optional rate limit. Execution never fails past its boundary: failures
//! become `Faulted(context, error)` events on the job's listeners and an
//! [`ExecutionOutcome`] for the caller.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::{panic_message, Error, Result};
use crate::events::{EventSource, LifecycleEvent, Listener, Observers, SubscriptionId};
use crate::rate_limiter::RateLimiter;

/// Future returned by a job action
pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Job work supplied as a closure
pub type JobAction =
    Arc<dyn Fn(Option<ExecutionContext>, CancellationToken) -> JobFuture + Send + Sync>;

/// Wrap an async closure into a [`JobAction`]
pub fn job_action<F, Fut>(f: F) -> JobAction
where
    F: Fn(Option<ExecutionContext>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context, cancel| Box::pin(f(context, cancel)))
}

/// Self-contained job logic, the alternative to a [`JobAction`]
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one execution
    async fn handle(
        &self,
        context: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// How one call to [`Job::execute`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The work ran to completion
    Completed,
    /// The work failed or panicked; a `Faulted` event was raised
    Faulted,
    /// All execution slots were busy; a `Faulted` event was raised
    Rejected,
    /// Cancelled while waiting for a rate-limit slot
    Canceled,
}

/// Unit of work driven by the orchestrator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Job: Send + Sync {
    /// Register a lifecycle listener (jobs only raise `Faulted`)
    fn subscribe(&self, listener: Listener) -> SubscriptionId;

    /// Remove a lifecycle listener
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Whether the orchestrator should run this job on a trigger event
    fn is_enabled(&self) -> bool;

    /// Run the job once
    async fn execute(
        &self,
        context: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome;
}

/// What a job runs
#[derive(Clone)]
pub enum JobWork {
    /// Injected closure
    Action(JobAction),
    /// Polymorphic implementation
    Handler(Arc<dyn JobHandler>),
}

impl JobWork {
    async fn run(
        &self,
        context: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            Self::Action(action) => action(context, cancel).await,
            Self::Handler(handler) => handler.handle(context, cancel).await,
        }
    }
}

impl fmt::Debug for JobWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(_) => f.write_str("Action(..)"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Concrete job with concurrency and rate limits
pub struct ScheduledJob {
    name: String,
    group: Option<String>,
    work: JobWork,
    max_concurrents: AtomicUsize,
    limiter: Option<RateLimiter>,
    enabled: AtomicBool,
    pressure: AtomicUsize,
    executions: AtomicU64,
    faults: AtomicU64,
    observers: Observers,
}

impl ScheduledJob {
    /// Create an enabled job with one execution slot and no rate limit
    pub fn new(name: impl Into<String>, work: JobWork) -> Self {
        Self {
            name: name.into(),
            group: None,
            work,
            max_concurrents: AtomicUsize::new(1),
            limiter: None,
            enabled: AtomicBool::new(true),
            pressure: AtomicUsize::new(0),
            executions: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            observers: Observers::new(),
        }
    }

    /// Set the group
    #[must_use]
    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    /// Set the minimum spacing between executions
    #[must_use]
    pub fn with_rate_limit(mut self, spacing: Option<std::time::Duration>) -> Self {
        self.limiter = spacing.map(RateLimiter::new);
        self
    }

    /// Set the concurrency ceiling at construction
    pub fn with_max_concurrents(self, max: usize) -> Result<Self> {
        self.set_max_concurrents(max)?;
        Ok(self)
    }

    /// Job name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Job group
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Concurrency ceiling
    #[must_use]
    pub fn max_concurrents(&self) -> usize {
        self.max_concurrents.load(Ordering::SeqCst)
    }

    /// Change the concurrency ceiling
    pub fn set_max_concurrents(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::invalid_config(
                "max_concurrents",
                "must be at least 1",
            ));
        }
        self.max_concurrents.store(max, Ordering::SeqCst);
        Ok(())
    }

    /// Minimum spacing between executions, if rate limited
    #[must_use]
    pub fn rate_limit(&self) -> Option<std::time::Duration> {
        self.limiter.as_ref().map(RateLimiter::spacing)
    }

    /// Enable or disable the job
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Executions currently holding a slot
    #[must_use]
    pub fn pressure(&self) -> usize {
        self.pressure.load(Ordering::SeqCst)
    }

    /// Executions that ran their work, whatever the result
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Faulted or rejected executions
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::SeqCst)
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.observers.len()
    }

    fn try_admit(&self) -> Option<SlotGuard<'_>> {
        let max = self.max_concurrents();
        self.pressure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                (p < max).then_some(p + 1)
            })
            .ok()
            .map(|_| SlotGuard {
                pressure: &self.pressure,
            })
    }

    fn fault(&self, context: Option<ExecutionContext>, error: Error) {
        self.faults.fetch_add(1, Ordering::SeqCst);
        let event = LifecycleEvent::faulted(EventSource::Job(self.name.clone()), context, error);
        // Failures of fault listeners are logged by the registry and dropped
        self.observers.notify(&event);
    }
}

/// Releases an execution slot when dropped
struct SlotGuard<'a> {
    pressure: &'a AtomicUsize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pressure.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Job for ScheduledJob {
    fn subscribe(&self, listener: Listener) -> SubscriptionId {
        self.observers.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        context: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let Some(_slot) = self.try_admit() else {
            let max = self.max_concurrents();
            warn!(job = %self.name, max, "Job at capacity, execution rejected");
            self.fault(
                context,
                Error::CapacityExceeded {
                    job: self.name.clone(),
                    max,
                },
            );
            return ExecutionOutcome::Rejected;
        };

        if let Some(limiter) = &self.limiter {
            let slot = limiter.reserve_slot();
            let wait = slot.saturating_duration_since(tokio::time::Instant::now());
            if !wait.is_zero() {
                debug!(job = %self.name, wait_ms = wait.as_millis() as u64, "Waiting for rate-limit slot");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        limiter.release(slot);
                        debug!(job = %self.name, "Job canceled while rate limited");
                        return ExecutionOutcome::Canceled;
                    }
                    _ = tokio::time::sleep_until(slot) => {}
                }
            }
        }

        self.executions.fetch_add(1, Ordering::SeqCst);
        let outcome = AssertUnwindSafe(self.work.run(context.clone(), cancel))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                debug!(job = %self.name, "Job completed");
                ExecutionOutcome::Completed
            }
            Ok(Err(e)) => {
                let error = Error::Execution {
                    job: self.name.clone(),
                    message: format!("{:#}", e),
                };
                warn!(job = %self.name, error = %error, "Job faulted");
                self.fault(context, error);
                ExecutionOutcome::Faulted
            }
            Err(payload) => {
                let error = Error::Panicked(panic_message(payload.as_ref()));
                warn!(job = %self.name, error = %error, "Job panicked");
                self.fault(context, error);
                ExecutionOutcome::Faulted
            }
        }
    }
}

impl fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("work", &self.work)
            .field("max_concurrents", &self.max_concurrents())
            .field("rate_limit", &self.rate_limit())
            .field("enabled", &self.is_enabled())
            .field("pressure", &self.pressure())
            .finish()
    }
}
