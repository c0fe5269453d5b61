//! Trigger activation engine
//!
//! A [`TimerTrigger`] owns a self-rescheduling loop:
//!
//! ```text
//!   sleep(max(schedule, rate limit))
//!        │
//!        ├── token cancelled ──────────────► Canceled(None), exit
//!        ├── counter >= max_occurrences ───► drain in-flight, Completed(None), exit
//!        ├── pressure >= max_concurrents ──► dropped tick, loop
//!        └── admit: counter++, pressure++, spawn fire action, loop
//!                                   │
//!                                   └─► Ok(true)  → Triggered(context)
//!                                       Ok(false) → nothing
//!                                       Err/panic → Faulted(None, error)
//! ```
//!
//! Faults never stop the loop. Terminal events are mutually exclusive: the
//! first stop reason to win the state transition raises its event and the
//! trigger raises nothing afterwards.
//!
//! Invocation results are delivered one listener at a time under an emission
//! gate, re-checking that the trigger is still active before each delivery.
//! The terminal transition takes the same gate, so once `deactivate` returns
//! no listener receives another `Triggered`.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::error::{panic_message, Error, Result};
use crate::events::{
    subscriber_fault, EventSource, LifecycleEvent, Listener, Observers, SubscriptionId,
};
use crate::rate_limiter::RateLimiter;
use crate::schedule::Schedule;

/// Future returned by a fire action
pub type FireFuture = Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send>>;

/// Asynchronous predicate evaluated on every admitted tick
pub type FireAction = Arc<dyn Fn(Option<ExecutionContext>) -> FireFuture + Send + Sync>;

/// Wrap an async closure into a [`FireAction`]
pub fn fire_action<F, Fut>(f: F) -> FireAction
where
    F: Fn(Option<ExecutionContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(move |context| Box::pin(f(context)))
}

const UNBOUNDED: u64 = u64::MAX;

thread_local! {
    /// Emission gates held by this thread while it delivers to listeners
    static HELD_GATES: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Event source driven by a schedule.
///
/// Implemented by [`TimerTrigger`]; the orchestrator only talks to this
/// trait so tests can substitute doubles.
#[cfg_attr(test, mockall::automock)]
pub trait Trigger: Send + Sync {
    /// Register a lifecycle listener
    fn subscribe(&self, listener: Listener) -> SubscriptionId;

    /// Remove a lifecycle listener
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Start the loop. Returns immediately.
    fn activate(&self, context: Option<ExecutionContext>, cancel: CancellationToken) -> Result<()>;

    /// Stop the loop before its next tick and raise `Completed(None)`
    fn deactivate(&self, reason: &str);
}

/// Immutable trigger configuration
#[derive(Clone)]
pub struct TriggerConfig {
    /// Predicate invoked on each admitted tick
    pub fire_action: FireAction,
    /// Tick timing
    pub schedule: Schedule,
    /// Initial ceiling on in-flight fire actions
    pub max_concurrents: usize,
    /// Initial occurrence budget, `None` for unbounded
    pub max_occurrences: Option<u64>,
    /// Minimum spacing between ticks, independent of the schedule
    pub rate_limit: Option<Duration>,
}

impl TriggerConfig {
    /// Configuration with one concurrent invocation and no occurrence limit
    pub fn new(fire_action: FireAction, schedule: impl Into<Schedule>) -> Self {
        Self {
            fire_action,
            schedule: schedule.into(),
            max_concurrents: 1,
            max_occurrences: None,
            rate_limit: None,
        }
    }

    /// Set the concurrency ceiling
    #[must_use]
    pub fn with_max_concurrents(mut self, max: usize) -> Self {
        self.max_concurrents = max;
        self
    }

    /// Set the occurrence budget
    #[must_use]
    pub fn with_max_occurrences(mut self, max: Option<u64>) -> Self {
        self.max_occurrences = max;
        self
    }

    /// Set the minimum spacing between ticks
    #[must_use]
    pub fn with_rate_limit(mut self, spacing: Option<Duration>) -> Self {
        self.rate_limit = spacing;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrents == 0 {
            return Err(Error::invalid_config(
                "max_concurrents",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerConfig")
            .field("schedule", &self.schedule)
            .field("max_concurrents", &self.max_concurrents)
            .field("max_occurrences", &self.max_occurrences)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

/// Trigger lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerState {
    /// Constructed, no configuration yet
    Idle = 0,
    /// Configured, loop not started
    Configured = 1,
    /// Loop running
    Active = 2,
    /// Stopped by occurrence exhaustion or deactivation
    Completed = 3,
    /// Stopped by the activation token
    Canceled = 4,
}

impl TriggerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Configured,
            2 => Self::Active,
            3 => Self::Completed,
            _ => Self::Canceled,
        }
    }

    /// Whether the trigger has stopped for good
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Configured => write!(f, "Configured"),
            Self::Active => write!(f, "Active"),
            Self::Completed => write!(f, "Completed"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
enum StopReason {
    Canceled,
    Deactivated(String),
    Exhausted,
}

impl StopReason {
    fn terminal_state(&self) -> TriggerState {
        match self {
            Self::Canceled => TriggerState::Canceled,
            Self::Deactivated(_) | Self::Exhausted => TriggerState::Completed,
        }
    }
}

/// Timer-driven trigger
pub struct TimerTrigger {
    inner: Arc<TriggerInner>,
}

struct TriggerInner {
    name: String,
    group: Option<String>,
    config: OnceLock<TriggerConfig>,
    state: AtomicU8,
    max_concurrents: AtomicUsize,
    max_occurrences: AtomicU64,
    /// Admitted invocations so far
    counter: AtomicU64,
    /// Invocations holding a concurrency slot
    pressure: AtomicUsize,
    /// Invocations that have not finished raising their events yet
    outstanding: AtomicUsize,
    settled: Notify,
    /// Internal stop signal used by `deactivate` and `Drop`
    stop: CancellationToken,
    /// Serializes invocation deliveries against the terminal transition
    gate: Mutex<()>,
    observers: Observers,
}

impl TimerTrigger {
    /// Create an unconfigured trigger
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_group(name, None)
    }

    /// Create an unconfigured trigger in a group
    pub fn with_group(name: impl Into<String>, group: Option<String>) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                name: name.into(),
                group,
                config: OnceLock::new(),
                state: AtomicU8::new(TriggerState::Idle as u8),
                max_concurrents: AtomicUsize::new(1),
                max_occurrences: AtomicU64::new(UNBOUNDED),
                counter: AtomicU64::new(0),
                pressure: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                settled: Notify::new(),
                stop: CancellationToken::new(),
                gate: Mutex::new(()),
                observers: Observers::new(),
            }),
        }
    }

    /// Create and configure a trigger in one step
    pub fn from_config(name: impl Into<String>, config: TriggerConfig) -> Result<Self> {
        let trigger = Self::new(name);
        trigger.configure(config)?;
        Ok(trigger)
    }

    /// Set the fire action, schedule and limits. Allowed once, before
    /// activation.
    pub fn configure(&self, config: TriggerConfig) -> Result<()> {
        config.validate()?;
        let inner = &self.inner;
        if inner.state() != TriggerState::Idle {
            return Err(Error::AlreadyConfigured);
        }

        let max_concurrents = config.max_concurrents;
        let max_occurrences = config.max_occurrences;
        inner
            .config
            .set(config)
            .map_err(|_| Error::AlreadyConfigured)?;

        inner.max_concurrents.store(max_concurrents, Ordering::SeqCst);
        self.set_max_occurrences(max_occurrences);
        inner
            .state
            .store(TriggerState::Configured as u8, Ordering::SeqCst);
        debug!(trigger = %inner.name, "Trigger configured");
        Ok(())
    }

    /// Trigger name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Trigger group
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.inner.group.as_deref()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> TriggerState {
        self.inner.state()
    }

    /// Total admitted invocations
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.inner.counter.load(Ordering::SeqCst)
    }

    /// Invocations currently in flight
    #[must_use]
    pub fn pressure(&self) -> usize {
        self.inner.pressure.load(Ordering::SeqCst)
    }

    /// Concurrency ceiling
    #[must_use]
    pub fn max_concurrents(&self) -> usize {
        self.inner.max_concurrents.load(Ordering::SeqCst)
    }

    /// Change the concurrency ceiling; takes effect on the next tick
    pub fn set_max_concurrents(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::invalid_config(
                "max_concurrents",
                "must be at least 1",
            ));
        }
        self.inner.max_concurrents.store(max, Ordering::SeqCst);
        Ok(())
    }

    /// Occurrence budget, `None` when unbounded
    #[must_use]
    pub fn max_occurrences(&self) -> Option<u64> {
        match self.inner.max_occurrences.load(Ordering::SeqCst) {
            UNBOUNDED => None,
            max => Some(max),
        }
    }

    /// Change the occurrence budget; checked on the next tick
    pub fn set_max_occurrences(&self, max: Option<u64>) {
        self.inner
            .max_occurrences
            .store(max.unwrap_or(UNBOUNDED), Ordering::SeqCst);
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.observers.len()
    }
}

impl Trigger for TimerTrigger {
    fn subscribe(&self, listener: Listener) -> SubscriptionId {
        self.inner.observers.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    fn activate(&self, context: Option<ExecutionContext>, cancel: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let config = inner.config.get().ok_or(Error::NotConfigured)?.clone();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        inner
            .state
            .compare_exchange(
                TriggerState::Configured as u8,
                TriggerState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::AlreadyActive)?;

        info!(
            trigger = %inner.name,
            schedule = ?config.schedule,
            max_concurrents = self.max_concurrents(),
            max_occurrences = ?self.max_occurrences(),
            "Trigger activated"
        );
        runtime.spawn(Arc::clone(inner).run(config, context, cancel));
        Ok(())
    }

    fn deactivate(&self, reason: &str) {
        let inner = &self.inner;
        if inner.finish(StopReason::Deactivated(reason.to_string())) {
            inner.stop.cancel();
        } else {
            debug!(
                trigger = %inner.name,
                state = %inner.state(),
                "Deactivation ignored, trigger is not active"
            );
        }
    }
}

impl Drop for TimerTrigger {
    fn drop(&mut self) {
        // Nobody can observe the trigger anymore; stop the loop silently.
        self.inner.stop.cancel();
    }
}

impl fmt::Debug for TimerTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerTrigger")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("counter", &self.counter())
            .field("pressure", &self.pressure())
            .finish()
    }
}

impl TriggerInner {
    fn state(&self) -> TriggerState {
        TriggerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_active(&self) -> bool {
        self.state() == TriggerState::Active
    }

    fn source(&self) -> EventSource {
        EventSource::Trigger(self.name.clone())
    }

    async fn run(
        self: Arc<Self>,
        config: TriggerConfig,
        context: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) {
        let limiter = config.rate_limit.map(RateLimiter::new);

        loop {
            let delay = config.schedule.next_delay();
            let wait = limiter.as_ref().map_or(delay, |l| l.stretch(delay));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            if wait.is_zero() {
                tokio::task::yield_now().await;
            }

            if self.stop.is_cancelled() || !self.is_active() {
                debug!(trigger = %self.name, "Trigger loop exiting after stop");
                return;
            }

            if cancel.is_cancelled() {
                self.finish(StopReason::Canceled);
                return;
            }

            let counter = self.counter.load(Ordering::SeqCst);
            if counter >= self.max_occurrences.load(Ordering::SeqCst) {
                self.settle(&cancel).await;
                let reason = if cancel.is_cancelled() {
                    StopReason::Canceled
                } else {
                    StopReason::Exhausted
                };
                self.finish(reason);
                return;
            }

            if !self.try_admit() {
                debug!(
                    trigger = %self.name,
                    pressure = self.pressure.load(Ordering::SeqCst),
                    "Concurrency ceiling reached, tick dropped"
                );
                continue;
            }

            let occurrence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(Arc::clone(&self).invoke(
                Arc::clone(&config.fire_action),
                context.clone(),
                occurrence,
            ));
        }
    }

    /// Take a concurrency slot if one is free
    fn try_admit(&self) -> bool {
        let max = self.max_concurrents.load(Ordering::SeqCst);
        let admitted = self
            .pressure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                (p < max).then_some(p + 1)
            })
            .is_ok();
        if admitted {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
        }
        admitted
    }

    async fn invoke(
        self: Arc<Self>,
        action: FireAction,
        context: Option<ExecutionContext>,
        occurrence: u64,
    ) {
        let outcome = AssertUnwindSafe(async { action(context.clone()).await })
            .catch_unwind()
            .await;
        self.pressure.fetch_sub(1, Ordering::SeqCst);

        if self.is_active() {
            match outcome {
                Ok(Ok(true)) => {
                    debug!(trigger = %self.name, occurrence, "Fire action succeeded");
                    self.emit_while_active(LifecycleEvent::triggered(self.source(), context));
                }
                Ok(Ok(false)) => {
                    debug!(trigger = %self.name, occurrence, "Fire action declined");
                }
                Ok(Err(e)) => {
                    let error = Error::FireAction(format!("{:#}", e));
                    warn!(trigger = %self.name, occurrence, error = %error, "Fire action faulted");
                    self.emit_while_active(LifecycleEvent::faulted(self.source(), None, error));
                }
                Err(payload) => {
                    let error = Error::Panicked(panic_message(payload.as_ref()));
                    warn!(trigger = %self.name, occurrence, error = %error, "Fire action panicked");
                    self.emit_while_active(LifecycleEvent::faulted(self.source(), None, error));
                }
            }
        } else {
            debug!(
                trigger = %self.name,
                occurrence,
                "Trigger stopped, invocation result discarded"
            );
        }

        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.settled.notify_waiters();
    }

    /// Wait until every admitted invocation has raised its events
    async fn settle(&self, cancel: &CancellationToken) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.stop.cancelled() => return,
                _ = &mut notified => {}
            }
        }
    }

    /// Move to the terminal state and raise its event. Returns `false` when
    /// another stop reason already won.
    fn finish(&self, reason: StopReason) -> bool {
        let terminal = reason.terminal_state();
        let transitioned = {
            let _gate = self.acquire_gate();
            self.state
                .compare_exchange(
                    TriggerState::Active as u8,
                    terminal as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        };
        if !transitioned {
            return false;
        }

        let event = match &reason {
            StopReason::Canceled => {
                info!(trigger = %self.name, "Trigger canceled");
                LifecycleEvent::canceled(self.source())
            }
            StopReason::Deactivated(why) => {
                info!(trigger = %self.name, reason = %why, "Trigger deactivated");
                LifecycleEvent::completed(self.source())
            }
            StopReason::Exhausted => {
                info!(
                    trigger = %self.name,
                    occurrences = self.counter.load(Ordering::SeqCst),
                    "Trigger reached its occurrence limit"
                );
                LifecycleEvent::completed(self.source())
            }
        };
        self.emit(event);
        true
    }

    fn gate_id(&self) -> usize {
        self as *const Self as usize
    }

    /// Take the emission gate for a terminal transition.
    ///
    /// A thread that is itself delivering (a listener stopping a trigger)
    /// never blocks here: it only takes the gate when it is free, and
    /// otherwise relies on the per-delivery state check.
    fn acquire_gate(&self) -> Option<MutexGuard<'_, ()>> {
        if HELD_GATES.with(|held| held.borrow().is_empty()) {
            return Some(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
        }
        match self.gate.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Run one listener delivery under the gate if the trigger is still
    /// active. Returns `false` when the trigger has stopped.
    fn deliver_while_active(&self, deliver: &mut dyn FnMut()) -> bool {
        let id = self.gate_id();
        let reentrant = HELD_GATES.with(|held| held.borrow().contains(&id));
        let _gate =
            (!reentrant).then(|| self.gate.lock().unwrap_or_else(PoisonError::into_inner));
        if !self.is_active() {
            return false;
        }

        HELD_GATES.with(|held| held.borrow_mut().push(id));
        deliver();
        HELD_GATES.with(|held| {
            held.borrow_mut().pop();
        });
        true
    }

    /// Raise an invocation result; delivery stops at the first listener
    /// that would see it after the terminal event.
    fn emit_while_active(&self, event: LifecycleEvent) {
        let gate = |deliver: &mut dyn FnMut()| self.deliver_while_active(deliver);
        let failures = self.observers.notify_gated(&event, gate);
        if failures.is_empty() || event.is_fault() {
            return;
        }
        self.observers
            .notify_gated(&subscriber_fault(self.source(), failures), gate);
    }

    fn emit(&self, event: LifecycleEvent) {
        let failures = self.observers.notify(&event);
        if failures.is_empty() || event.is_fault() {
            return;
        }
        self.observers
            .notify(&subscriber_fault(self.source(), failures));
    }
}
