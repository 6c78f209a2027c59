//! Circuit breaker guarding store access.
//!
//! Closed: calls pass and outcomes are recorded in a sliding window. Once the
//! window holds at least `min_samples` outcomes and the failure rate reaches
//! `failure_threshold`, the breaker opens. Open: calls fail fast with
//! [`QueueError::CircuitOpen`] until `cooldown` has elapsed, then a single
//! probe is let through (half-open). The probe's outcome closes or re-opens
//! the breaker.
//!
//! Only [`QueueError::StoreUnavailable`] counts as a failure; every other
//! error is an answer from a healthy store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use spindle_core::Clock;
use spindle_core::clock::to_chrono;

use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failure rate (0.0-1.0) that opens the breaker.
    pub failure_threshold: f64,
    pub window: Duration,
    pub cooldown: Duration,
    pub min_samples: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            min_samples: 20,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    last_transition: DateTime<Utc>,
    results: VecDeque<(DateTime<Utc>, bool)>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                last_transition: now,
                results: VecDeque::new(),
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call may proceed. In half-open state only one caller at a
    /// time gets `true`.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now - inner.last_transition >= to_chrono(self.config.cooldown) {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_transition = now;
                    inner.probe_in_flight = true;
                    info!("circuit breaker half-open; probing store");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record(&self, ok: bool) {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.config.window);
        let mut inner = self.lock();

        while inner.results.front().is_some_and(|(at, _)| *at <= cutoff) {
            inner.results.pop_front();
        }
        inner.results.push_back((now, ok));

        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
            inner.last_transition = now;
            if ok {
                inner.state = BreakerState::Closed;
                inner.results.clear();
                info!("circuit breaker closed");
            } else {
                inner.state = BreakerState::Open;
                warn!("circuit breaker re-opened after failed probe");
            }
            return;
        }

        let total = inner.results.len();
        if inner.state != BreakerState::Closed || total < self.config.min_samples {
            return;
        }
        let failures = inner.results.iter().filter(|(_, ok)| !ok).count();
        let rate = failures as f64 / total as f64;
        if rate >= self.config.failure_threshold {
            inner.state = BreakerState::Open;
            inner.last_transition = now;
            warn!(failures, total, rate, "circuit breaker opened");
        }
    }

    /// Run `f` under the breaker.
    pub fn call<T>(&self, f: impl FnOnce() -> QueueResult<T>) -> QueueResult<T> {
        if !self.allow() {
            return Err(QueueError::CircuitOpen);
        }
        let result = f();
        self.record(!matches!(&result, Err(e) if e.is_store_failure()));
        result
    }
}
