//! Retry/backoff policy and the failure state machine.
//!
//! ```text
//! Ready -> Claimed -> { Ready(delayed) | DLQ | Ready }
//! ```
//!
//! On every failure (worker-reported or lease expiry) the attempt counter is
//! incremented first; the policy then either schedules a delayed retry or
//! stops. Non-retryable error classes stop on the first failure.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::saturating_add;
use crate::dead_letter::DeadLetterCause;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Default `max_attempts` for jobs enqueued without an explicit value.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); the delay is spread by +/- this fraction.
    pub jitter: f64,
    /// Error classes that go straight to the dead-letter queue.
    pub non_retryable: BTreeSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            non_retryable: BTreeSet::new(),
        }
    }
}

/// Outcome of evaluating a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to Ready, not dequeueable before `not_before`.
    Retry {
        not_before: DateTime<Utc>,
        delay: Duration,
    },
    /// Promote to the dead-letter queue.
    DeadLetter { cause: DeadLetterCause },
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            non_retryable: BTreeSet::new(),
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            non_retryable: BTreeSet::new(),
        }
    }

    /// Mark an error class as non-retryable.
    pub fn with_non_retryable(mut self, class: impl Into<String>) -> Self {
        self.non_retryable.insert(class.into());
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn is_retryable(&self, class: &str) -> bool {
        !self.non_retryable.contains(class)
    }

    /// Un-jittered delay for a given attempt number (1-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Delay for `attempt` with jitter applied; never exceeds `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = rand::rng().random_range(-jitter..=jitter);
        let jittered = delay.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max_delay)
    }

    /// Evaluate a failure. `attempt` is the count *after* this failure was
    /// recorded; `max_attempts` is the job's own ceiling.
    pub fn decide(
        &self,
        attempt: u32,
        max_attempts: u32,
        error_class: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !self.is_retryable(error_class) {
            return RetryDecision::DeadLetter {
                cause: DeadLetterCause::PolicyViolation,
            };
        }
        if attempt >= max_attempts {
            return RetryDecision::DeadLetter {
                cause: DeadLetterCause::Exhausted,
            };
        }

        let delay = self.backoff(attempt);
        RetryDecision::Retry {
            not_before: saturating_add(now, delay),
            delay,
        }
    }
}
