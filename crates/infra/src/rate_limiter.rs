//! Token-bucket admission control.
//!
//! One bucket per (scope, priority) whose refill rate is the base rate scaled
//! by the priority weight, plus an optional aggregate bucket per scope. A
//! request is admitted only if every applicable bucket can pay; the check and
//! the consume happen in one store transaction, so concurrent callers on the
//! same scope cannot both spend the last token.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use spindle_core::{Clock, Priority, TokenBucket};

use crate::breaker::CircuitBreaker;
use crate::codec::{encode, get_json};
use crate::error::{QueueError, QueueResult};
use crate::keys::Keys;
use crate::store::Store;

/// Behaviour when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Admit the request.
    Open,
    /// Reject the request with the store error.
    #[default]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketLimits {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Burst ceiling of each per-priority bucket.
    pub capacity: f64,
    /// Refill rate (tokens/second) of a weight-1.0 class.
    pub refill_rate: f64,
    pub weights: BTreeMap<Priority, f64>,
    /// Hard ceiling across all priorities of a scope.
    pub aggregate: Option<BucketLimits>,
    pub fail_mode: FailMode,
    /// Idle buckets are dropped after this long; they come back full. A
    /// bucket is always kept at least until it would have refilled on its
    /// own, and forever when its refill rate is zero.
    pub bucket_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100.0,
            refill_rate: 50.0,
            weights: BTreeMap::from([
                (Priority::High, 2.0),
                (Priority::Normal, 1.0),
                (Priority::Low, 0.5),
            ]),
            aggregate: None,
            fail_mode: FailMode::Closed,
            bucket_ttl: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    pub fn weight(&self, priority: Priority) -> f64 {
        self.weights.get(&priority).copied().unwrap_or(1.0)
    }

    pub fn limits_for(&self, priority: Priority) -> BucketLimits {
        BucketLimits {
            capacity: self.capacity,
            refill_rate: self.refill_rate * self.weight(priority),
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    /// Zero when allowed; otherwise the wait until every bucket could pay.
    pub retry_after: Duration,
}

impl Admission {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Point-in-time view of one bucket, refilled to "now".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub scope: String,
    /// `None` for the aggregate bucket.
    pub priority: Option<Priority>,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
}

pub struct RateLimiter<S> {
    store: S,
    keys: Keys,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    breaker: Arc<CircuitBreaker>,
}

impl<S: Store> RateLimiter<S> {
    pub fn new(
        store: S,
        keys: Keys,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            clock,
            breaker,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check-and-consume `cost` tokens for `scope` at `priority`.
    pub fn try_acquire(&self, scope: &str, priority: Priority, cost: f64) -> QueueResult<Admission> {
        if !self.config.enabled {
            return Ok(Admission::allowed());
        }
        self.validate_cost(priority, cost)?;

        match self.breaker.call(|| self.check_and_consume(scope, priority, cost)) {
            Ok(admission) => {
                if !admission.allowed {
                    debug!(
                        scope,
                        priority = %priority,
                        cost,
                        retry_after_ms = admission.retry_after.as_millis() as u64,
                        "rate limited"
                    );
                }
                Ok(admission)
            }
            Err(e @ (QueueError::StoreUnavailable(_) | QueueError::CircuitOpen)) => {
                match self.config.fail_mode {
                    FailMode::Open => {
                        warn!(scope, error = %e, "rate limiter store unavailable; failing open");
                        Ok(Admission::allowed())
                    }
                    FailMode::Closed => {
                        warn!(scope, error = %e, "rate limiter store unavailable; failing closed");
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    fn validate_cost(&self, priority: Priority, cost: f64) -> QueueResult<()> {
        if !cost.is_finite() || cost <= 0.0 {
            return Err(QueueError::InvalidRequest(format!(
                "rate limit cost must be positive, got {cost}"
            )));
        }
        let class = self.config.limits_for(priority);
        let ceiling = match self.config.aggregate {
            Some(agg) => class.capacity.min(agg.capacity),
            None => class.capacity,
        };
        if cost > ceiling {
            return Err(QueueError::InvalidRequest(format!(
                "cost {cost} exceeds bucket capacity {ceiling}; it could never be admitted"
            )));
        }
        Ok(())
    }

    fn check_and_consume(&self, scope: &str, priority: Priority, cost: f64) -> QueueResult<Admission> {
        let class_key = self.keys.bucket(scope, Some(priority));
        let aggregate_key = self.keys.bucket(scope, None);
        let class_limits = self.config.limits_for(priority);

        self.store.transact(|txn| {
            let now = self.clock.now();
            let mut buckets = vec![(
                class_key.as_str(),
                load_bucket(get_json(txn, &class_key)?, class_limits, now),
            )];
            if let Some(limits) = self.config.aggregate {
                buckets.push((
                    aggregate_key.as_str(),
                    load_bucket(get_json(txn, &aggregate_key)?, limits, now),
                ));
            }

            for (_, bucket) in buckets.iter_mut() {
                bucket.refill(now);
            }
            let wait = buckets
                .iter()
                .map(|(_, b)| b.wait_for(cost))
                .max()
                .unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                return Ok(Admission::denied(wait));
            }

            for (key, mut bucket) in buckets {
                bucket.consume(cost);
                let ttl = idle_ttl(&bucket, self.config.bucket_ttl);
                txn.set(key, encode(&bucket)?, ttl);
            }
            Ok(Admission::allowed())
        })
    }

    /// Current bucket levels for a scope, without consuming anything.
    pub fn snapshot(&self, scope: &str) -> QueueResult<Vec<BucketSnapshot>> {
        let now = self.clock.now();
        let mut targets: Vec<(Option<Priority>, BucketLimits)> = Priority::ALL
            .iter()
            .map(|p| (Some(*p), self.config.limits_for(*p)))
            .collect();
        if let Some(limits) = self.config.aggregate {
            targets.push((None, limits));
        }

        self.breaker.call(|| {
            self.store.transact(|txn| {
                targets
                    .iter()
                    .map(|(priority, limits)| {
                        let key = self.keys.bucket(scope, *priority);
                        let mut bucket = load_bucket(get_json(txn, &key)?, *limits, now);
                        bucket.refill(now);
                        Ok(BucketSnapshot {
                            scope: scope.to_string(),
                            priority: *priority,
                            tokens: bucket.tokens,
                            capacity: bucket.capacity,
                            refill_rate: bucket.refill_rate,
                        })
                    })
                    .collect::<QueueResult<Vec<_>>>()
            })
        })
    }
}

/// Expiry for a freshly written bucket. Dropping a bucket resets it to full,
/// so it must outlive the time it needs to refill from empty.
fn idle_ttl(bucket: &TokenBucket, floor: Duration) -> Option<Duration> {
    if bucket.refill_rate <= 0.0 {
        return None;
    }
    let refill = Duration::try_from_secs_f64(bucket.capacity / bucket.refill_rate).ok()?;
    Some(floor.max(refill + Duration::from_secs(1)))
}

/// A missing bucket starts full; a stored one picks up current limits.
fn load_bucket(
    stored: Option<TokenBucket>,
    limits: BucketLimits,
    now: chrono::DateTime<chrono::Utc>,
) -> TokenBucket {
    match stored {
        Some(mut bucket) => {
            bucket.reconfigure(limits.capacity, limits.refill_rate);
            bucket
        }
        None => TokenBucket::full(limits.capacity, limits.refill_rate, now),
    }
}
