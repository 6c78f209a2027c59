//! Time source abstraction.
//!
//! Every time-dependent decision (lease expiry, token refill, backoff
//! eligibility) reads the clock through this trait so tests can drive time
//! explicitly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = saturating_add(*now, by);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Saturating conversion from `std` to `chrono` durations.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, or `None` when the result falls outside the representable range.
pub fn checked_add(at: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
}

/// `at + d`, pinned to the latest representable instant on overflow.
pub fn saturating_add(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    checked_add(at, d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds since the Unix epoch; the score unit used by ordered indexes.
pub fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!((clock.now() - t0).num_seconds(), 5);
    }

    #[test]
    fn adding_huge_durations_does_not_overflow() {
        let now = Utc::now();
        let huge = Duration::from_secs(u64::MAX);
        assert_eq!(checked_add(now, huge), None);
        assert_eq!(saturating_add(now, huge), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            checked_add(now, Duration::from_secs(1)),
            Some(now + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn clones_share_time() {
        let clock = ManualClock::starting_now();
        let other = clock.clone();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), other.now());
    }
}
