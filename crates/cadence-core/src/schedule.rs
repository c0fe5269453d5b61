//! Resolved schedules consumed by triggers.
//!
//! A trigger never sees a schedule string. Whatever produces the timing
//! (a fixed period, a cron library, a calendar) hands over either a fixed
//! interval or a function yielding the time until the next fire.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Function returning the delay until the next tick
pub type NextFireFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// When a trigger ticks
#[derive(Clone)]
pub enum Schedule {
    /// Tick every fixed interval
    Interval(Duration),
    /// Ask the collaborator for the delay before each tick
    NextFire(NextFireFn),
}

impl Schedule {
    /// Fixed interval schedule
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self::Interval(interval)
    }

    /// Fixed interval in milliseconds
    #[must_use]
    pub fn every_ms(millis: u64) -> Self {
        Self::Interval(Duration::from_millis(millis))
    }

    /// Schedule driven by a "time until next fire" function
    pub fn from_fn<F>(next_fire: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Self::NextFire(Arc::new(next_fire))
    }

    /// Delay before the next tick
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        match self {
            Self::Interval(interval) => *interval,
            Self::NextFire(next_fire) => next_fire(),
        }
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(interval) => f.debug_tuple("Interval").field(interval).finish(),
            Self::NextFire(_) => f.write_str("NextFire(..)"),
        }
    }
}

impl From<Duration> for Schedule {
    fn from(interval: Duration) -> Self {
        Self::Interval(interval)
    }
}
