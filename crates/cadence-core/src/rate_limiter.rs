//! Minimum-spacing rate limiting
//!
//! A limiter enforces a minimum gap between successive admitted
//! invocations. Triggers use it to stretch their tick interval; jobs use it
//! to delay an admitted execution until its reserved slot comes up.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Spacing limiter with slot reservation
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    /// Earliest instant the next reservation may use
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter enforcing `spacing` between admissions
    #[must_use]
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    /// Create a limiter from a millisecond spacing
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Configured minimum spacing
    #[must_use]
    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Effective wait for a tick scheduled `interval` from now.
    ///
    /// Rate limiting only ever lengthens the gap.
    #[must_use]
    pub fn stretch(&self, interval: Duration) -> Duration {
        interval.max(self.spacing)
    }

    /// Reserve the next admission slot and return how long the caller must
    /// wait before using it. Concurrent callers get distinct, spaced slots.
    pub fn reserve(&self) -> Duration {
        self.reserve_slot().saturating_duration_since(Instant::now())
    }

    /// Reserve the next admission slot and return the instant it opens
    pub fn reserve_slot(&self) -> Instant {
        let now = Instant::now();
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.spacing);
        slot
    }

    /// Hand back a slot that will not be used.
    ///
    /// Only the most recent reservation can be returned: later reservations
    /// were already spaced after it.
    pub fn release(&self, slot: Instant) -> bool {
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        if *next == Some(slot + self.spacing) {
            *next = Some(slot);
            true
        } else {
            false
        }
    }

    /// Time until a reservation made now could run without waiting
    #[must_use]
    pub fn pending(&self) -> Duration {
        let now = Instant::now();
        match *self.next_slot.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(at) if at > now => at - now,
            _ => Duration::ZERO,
        }
    }

    /// Forget previous reservations
    pub fn reset(&self) {
        *self.next_slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self::new(self.spacing)
    }
}
