//! Token-bucket arithmetic.
//!
//! Refill is computed lazily from elapsed time on every check; no timer ever
//! touches a bucket. The infra rate limiter persists these records and runs
//! the check-and-consume inside one store transaction.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted bucket state. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    pub updated_at: DateTime<Utc>,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn full(capacity: f64, refill_rate: f64, now: DateTime<Utc>) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: refill_rate.max(0.0),
            updated_at: now,
        }
    }

    /// Apply new limits, clamping the current balance.
    pub fn reconfigure(&mut self, capacity: f64, refill_rate: f64) {
        self.capacity = capacity.max(0.0);
        self.refill_rate = refill_rate.max(0.0);
        self.tokens = self.tokens.clamp(0.0, self.capacity);
    }

    /// Accrue tokens for the time elapsed since `updated_at`.
    ///
    /// A clock that moved backwards accrues nothing and does not rewind
    /// `updated_at`.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed_ms = (now - self.updated_at).num_milliseconds();
        if elapsed_ms <= 0 {
            return;
        }
        let accrued = (elapsed_ms as f64 / 1000.0) * self.refill_rate;
        self.tokens = (self.tokens + accrued).min(self.capacity);
        self.updated_at = now;
    }

    pub fn can_afford(&self, cost: f64) -> bool {
        self.tokens >= cost
    }

    pub fn consume(&mut self, cost: f64) {
        self.tokens = (self.tokens - cost).max(0.0);
    }

    /// Time until `cost` tokens will be available (zero if already available).
    pub fn wait_for(&self, cost: f64) -> Duration {
        if self.tokens >= cost {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        let secs = (cost - self.tokens) / self.refill_rate;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Refill, then consume `cost` if affordable. Returns the wait hint on denial.
    pub fn try_consume(&mut self, cost: f64, now: DateTime<Utc>) -> Result<(), Duration> {
        self.refill(now);
        if self.can_afford(cost) {
            self.consume(cost);
            Ok(())
        } else {
            Err(self.wait_for(cost))
        }
    }
}
