//! Orchestrator - composes triggers with jobs
//!
//! Triggers and jobs are wired at add time: the orchestrator subscribes an
//! internal listener to each one immediately, so doubles can observe the
//! subscription without the orchestrator ever being started. After
//! [`Orchestrator::start`] the orchestrator is purely reactive: every
//! `Triggered` event fans out to all enabled jobs, and every lifecycle event
//! is re-raised to the orchestrator's own listeners and published on its
//! [`EventBus`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, SchedulerEvent};
use crate::events::{
    listener, subscriber_fault, EventKind, EventSource, LifecycleEvent, Listener, Observers,
    SubscriptionId,
};
use crate::job::Job;
use crate::trigger::Trigger;

/// Aggregated event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Re-raised `Triggered` events
    pub triggered: u64,
    /// Re-raised `Faulted` events, including listener faults
    pub faulted: u64,
    /// Re-raised `Canceled` events
    pub canceled: u64,
    /// Re-raised `Completed` events
    pub completed: u64,
}

/// Holds triggers and jobs and drives jobs from trigger events
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct Registration<T: ?Sized> {
    component: Arc<T>,
    subscription: SubscriptionId,
}

struct OrchestratorInner {
    config: SchedulerConfig,
    jobs: RwLock<Vec<Registration<dyn Job>>>,
    triggers: RwLock<Vec<Registration<dyn Trigger>>>,
    started: AtomicBool,
    /// Token passed to `start`; jobs receive child tokens of it
    cancel: Mutex<Option<CancellationToken>>,
    /// Job executions spawned by fan-out that have not returned yet
    running: AtomicUsize,
    idle: Notify,
    observers: Observers,
    bus: EventBus,
    triggered: AtomicU64,
    faulted: AtomicU64,
    canceled: AtomicU64,
    completed: AtomicU64,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Create an orchestrator with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create an orchestrator with the given configuration
    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                jobs: RwLock::new(Vec::new()),
                triggers: RwLock::new(Vec::new()),
                started: AtomicBool::new(false),
                cancel: Mutex::new(None),
                running: AtomicUsize::new(0),
                idle: Notify::new(),
                observers: Observers::new(),
                bus,
                triggered: AtomicU64::new(0),
                faulted: AtomicU64::new(0),
                canceled: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    /// Configuration the orchestrator was created with
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a job and subscribe to its faults
    pub fn add_job(&self, job: Arc<dyn Job>) -> Result<()> {
        self.ensure_not_started()?;
        let subscription = job.subscribe(self.inner.job_listener());
        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                component: job,
                subscription,
            });
        Ok(())
    }

    /// Register a trigger and subscribe to its lifecycle events
    pub fn add_trigger(&self, trigger: Arc<dyn Trigger>) -> Result<()> {
        self.ensure_not_started()?;
        let subscription = trigger.subscribe(self.inner.trigger_listener());
        self.inner
            .triggers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                component: trigger,
                subscription,
            });
        Ok(())
    }

    /// Unsubscribe and drop a job. Returns `false` if it was not registered.
    pub fn remove_job(&self, job: &Arc<dyn Job>) -> bool {
        let removed = take_registration(&self.inner.jobs, job);
        removed
            .map(|r| r.component.unsubscribe(r.subscription))
            .is_some()
    }

    /// Unsubscribe and drop a trigger. Returns `false` if it was not
    /// registered.
    pub fn remove_trigger(&self, trigger: &Arc<dyn Trigger>) -> bool {
        let removed = take_registration(&self.inner.triggers, trigger);
        removed
            .map(|r| r.component.unsubscribe(r.subscription))
            .is_some()
    }

    /// Registered jobs in insertion order
    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<dyn Job>> {
        snapshot(&self.inner.jobs)
    }

    /// Registered triggers in insertion order
    #[must_use]
    pub fn triggers(&self) -> Vec<Arc<dyn Trigger>> {
        snapshot(&self.inner.triggers)
    }

    /// Whether `start` has succeeded
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Activate every registered trigger once and return.
    ///
    /// Fails before activating anything when no job or no trigger is
    /// registered, or when already started. If a trigger refuses to
    /// activate, the triggers activated before it are deactivated (their
    /// `Completed` events still reach aggregate listeners), the orchestrator
    /// returns to the not-started state and the error is returned.
    pub fn start(&self, context: Option<ExecutionContext>, cancel: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let triggers = self.triggers();
        let job_count = inner.jobs.read().unwrap_or_else(PoisonError::into_inner).len();
        if job_count == 0 {
            return Err(Error::NoJobs);
        }
        if triggers.is_empty() {
            return Err(Error::NoTriggers);
        }
        if inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        *inner.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        for (index, trigger) in triggers.iter().enumerate() {
            if let Err(e) = trigger.activate(context.clone(), cancel.clone()) {
                warn!(error = %e, "Trigger activation failed, aborting start");
                for activated in &triggers[..index] {
                    activated.deactivate("orchestrator start aborted");
                }
                *inner.cancel.lock().unwrap_or_else(PoisonError::into_inner) = None;
                inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        info!(
            triggers = triggers.len(),
            jobs = job_count,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Deactivate every trigger
    pub fn stop(&self, reason: &str) {
        info!(reason = %reason, "Stopping orchestrator");
        for trigger in self.triggers() {
            trigger.deactivate(reason);
        }
    }

    /// Register an aggregate listener
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        self.inner.observers.subscribe(listener)
    }

    /// Remove an aggregate listener
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    /// Receive every aggregated event from now on
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.bus.subscribe()
    }

    /// Job executions started by fan-out that are still running
    #[must_use]
    pub fn running_jobs(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wait until no job execution started by fan-out is running
    pub async fn wait_idle(&self) {
        let inner = &self.inner;
        loop {
            let notified = inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Event counters
    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        let inner = &self.inner;
        OrchestratorStats {
            triggered: inner.triggered.load(Ordering::SeqCst),
            faulted: inner.faulted.load(Ordering::SeqCst),
            canceled: inner.canceled.load(Ordering::SeqCst),
            completed: inner.completed.load(Ordering::SeqCst),
        }
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }
}

impl OrchestratorInner {
    fn trigger_listener(self: &Arc<Self>) -> Listener {
        let weak: Weak<Self> = Arc::downgrade(self);
        listener(move |event| {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if matches!(event.kind, EventKind::Triggered) {
                inner.fan_out(event.context.clone());
            }
            inner.raise(event.clone());
            Ok(())
        })
    }

    fn job_listener(self: &Arc<Self>) -> Listener {
        let weak: Weak<Self> = Arc::downgrade(self);
        listener(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.raise(event.clone());
            }
            Ok(())
        })
    }

    /// Run every enabled job with the trigger context
    fn fan_out(self: &Arc<Self>, context: Option<ExecutionContext>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Triggered outside of a tokio runtime, jobs not executed");
            return;
        };
        let parent = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();

        for job in snapshot(&self.jobs) {
            if !job.is_enabled() {
                debug!("Skipping disabled job");
                continue;
            }
            let context = context.clone();
            let cancel = parent.child_token();
            let inner = Arc::clone(self);
            inner.running.fetch_add(1, Ordering::SeqCst);
            runtime.spawn(async move {
                let outcome = job.execute(context, cancel).await;
                debug!(outcome = ?outcome, "Job execution finished");
                inner.running.fetch_sub(1, Ordering::SeqCst);
                inner.idle.notify_waiters();
            });
        }
    }

    fn raise(&self, event: LifecycleEvent) {
        self.count(&event);
        self.bus.publish(SchedulerEvent::from_lifecycle(&event));

        let failures = self.observers.notify(&event);
        if failures.is_empty() || event.is_fault() {
            return;
        }

        let fault = subscriber_fault(EventSource::Orchestrator, failures);
        self.count(&fault);
        self.bus.publish(SchedulerEvent::from_lifecycle(&fault));
        self.observers.notify(&fault);
    }

    fn count(&self, event: &LifecycleEvent) {
        let counter = match event.kind {
            EventKind::Triggered => &self.triggered,
            EventKind::Faulted(_) => &self.faulted,
            EventKind::Canceled => &self.canceled,
            EventKind::Completed => &self.completed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn snapshot<T: ?Sized>(registry: &RwLock<Vec<Registration<T>>>) -> Vec<Arc<T>> {
    registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|r| Arc::clone(&r.component))
        .collect()
}

fn take_registration<T: ?Sized>(
    registry: &RwLock<Vec<Registration<T>>>,
    component: &Arc<T>,
) -> Option<Registration<T>> {
    let mut registry = registry.write().unwrap_or_else(PoisonError::into_inner);
    let index = registry
        .iter()
        .position(|r| same_instance(&r.component, component))?;
    Some(registry.remove(index))
}

/// Identity comparison on the data pointer only
fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

#[cfg(test)]
mod tests;
