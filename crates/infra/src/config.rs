//! Queue configuration.
//!
//! Every section has working defaults; `from_env` layers `SPINDLE_*`
//! environment variables on top.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use spindle_core::RetryPolicy;

use crate::breaker::BreakerConfig;
use crate::error::{QueueError, QueueResult};
use crate::rate_limiter::{FailMode, RateLimitConfig};

/// Upper bound for configured leases and retry delays.
pub const MAX_SCHEDULE_HORIZON: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub connect_timeout: Duration,
    /// Attempts per optimistic transaction before giving up.
    pub max_txn_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            max_txn_attempts: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Consecutive picks from one class before the next-lower class gets one; 0 disables.
    pub starvation_limit: u32,
    /// How long a blocking dequeue waits for ready work.
    pub dequeue_timeout: Duration,
    /// Re-check interval for stores without change notifications.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            starvation_limit: 5,
            dequeue_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub default_duration: Duration,
    pub max_duration: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(30),
            max_duration: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Claims reclaimed per tick, across all queues.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub heartbeat_interval: Duration,
    /// Heartbeats older than this are considered dead and pruned.
    pub heartbeat_ttl: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Key prefix for every record.
    pub namespace: String,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub lease: LeaseConfig,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub reaper: ReaperConfig,
    pub fleet: FleetConfig,
    /// How long an idempotency key maps to its original job.
    pub idempotency_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "spindle".to_string(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            lease: LeaseConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            reaper: ReaperConfig::default(),
            fleet: FleetConfig::default(),
            idempotency_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> QueueResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| QueueError::Config(format!("{name}: cannot parse {raw:?}")))
}

fn parse_millis(name: &str, raw: &str) -> QueueResult<Duration> {
    parse::<u64>(name, raw).map(Duration::from_millis)
}

fn parse_bool(name: &str, raw: &str) -> QueueResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(QueueError::Config(format!("{name}: expected a boolean, got {raw:?}"))),
    }
}

impl QueueConfig {
    /// Defaults overridden by `SPINDLE_*` environment variables, validated.
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`QueueConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> QueueResult<Self> {
        let mut cfg = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("SPINDLE_NAMESPACE") {
            cfg.namespace = v;
        }
        if let Some(v) = var("SPINDLE_STORE") {
            cfg.store.backend = match v.trim().to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "redis" => StoreBackend::Redis,
                other => {
                    return Err(QueueError::Config(format!(
                        "SPINDLE_STORE: unknown backend {other:?}"
                    )));
                }
            };
        }
        if let Some(v) = var("SPINDLE_REDIS_URL") {
            cfg.store.redis_url = v;
        }
        if let Some(v) = var("SPINDLE_STARVATION_LIMIT") {
            cfg.scheduler.starvation_limit = parse("SPINDLE_STARVATION_LIMIT", &v)?;
        }
        if let Some(v) = var("SPINDLE_DEQUEUE_TIMEOUT_MS") {
            cfg.scheduler.dequeue_timeout = parse_millis("SPINDLE_DEQUEUE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("SPINDLE_LEASE_MS") {
            cfg.lease.default_duration = parse_millis("SPINDLE_LEASE_MS", &v)?;
        }
        if let Some(v) = var("SPINDLE_MAX_ATTEMPTS") {
            cfg.retry.max_attempts = parse("SPINDLE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("SPINDLE_BACKOFF_BASE_MS") {
            cfg.retry.base_delay = parse_millis("SPINDLE_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = var("SPINDLE_BACKOFF_MAX_MS") {
            cfg.retry.max_delay = parse_millis("SPINDLE_BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = var("SPINDLE_NON_RETRYABLE") {
            cfg.retry.non_retryable = v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("SPINDLE_RATE_LIMIT_ENABLED") {
            cfg.rate_limit.enabled = parse_bool("SPINDLE_RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = var("SPINDLE_RATE_CAPACITY") {
            cfg.rate_limit.capacity = parse("SPINDLE_RATE_CAPACITY", &v)?;
        }
        if let Some(v) = var("SPINDLE_RATE_PER_SEC") {
            cfg.rate_limit.refill_rate = parse("SPINDLE_RATE_PER_SEC", &v)?;
        }
        if let Some(v) = var("SPINDLE_RATE_FAIL_OPEN") {
            cfg.rate_limit.fail_mode = if parse_bool("SPINDLE_RATE_FAIL_OPEN", &v)? {
                FailMode::Open
            } else {
                FailMode::Closed
            };
        }
        if let Some(v) = var("SPINDLE_REAPER_INTERVAL_MS") {
            cfg.reaper.interval = parse_millis("SPINDLE_REAPER_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("SPINDLE_REAPER_BATCH") {
            cfg.reaper.batch_size = parse("SPINDLE_REAPER_BATCH", &v)?;
        }
        if let Some(v) = var("SPINDLE_HEARTBEAT_TTL_MS") {
            cfg.fleet.heartbeat_ttl = parse_millis("SPINDLE_HEARTBEAT_TTL_MS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> QueueResult<()> {
        let invalid = |msg: String| Err(QueueError::Config(msg));

        if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace) {
            return invalid(format!("namespace {:?} must be non-empty without whitespace", self.namespace));
        }
        if self.lease.default_duration.is_zero() {
            return invalid("lease.default_duration must be > 0".into());
        }
        if self.lease.default_duration > self.lease.max_duration {
            return invalid("lease.default_duration exceeds lease.max_duration".into());
        }
        if self.lease.max_duration > MAX_SCHEDULE_HORIZON {
            return invalid("lease.max_duration must not exceed one year".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be >= 1".into());
        }
        if self.retry.base_delay > self.retry.max_delay {
            return invalid("retry.base_delay exceeds retry.max_delay".into());
        }
        if self.retry.max_delay > MAX_SCHEDULE_HORIZON {
            return invalid("retry.max_delay must not exceed one year".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within 0.0..=1.0".into());
        }
        if self.scheduler.poll_interval.is_zero() {
            return invalid("scheduler.poll_interval must be > 0".into());
        }
        if self.scheduler.dequeue_timeout > self.fleet.heartbeat_ttl / 2 {
            return invalid(
                "scheduler.dequeue_timeout must not exceed half of fleet.heartbeat_ttl".into(),
            );
        }
        if self.fleet.heartbeat_interval >= self.fleet.heartbeat_ttl {
            return invalid("fleet.heartbeat_interval must be shorter than fleet.heartbeat_ttl".into());
        }
        if self.reaper.batch_size == 0 || self.reaper.interval.is_zero() {
            return invalid("reaper.batch_size and reaper.interval must be > 0".into());
        }
        if self.rate_limit.enabled {
            let rl = &self.rate_limit;
            if rl.weights.is_empty() {
                return invalid("rate_limit.weights must not be empty".into());
            }
            if rl.capacity <= 0.0 || rl.refill_rate < 0.0 {
                return invalid("rate_limit.capacity must be > 0 and refill_rate >= 0".into());
            }
            if rl.weights.values().any(|w| !w.is_finite() || *w < 0.0) {
                return invalid("rate_limit.weights must be finite and >= 0".into());
            }
            if let Some(agg) = rl.aggregate {
                if agg.capacity <= 0.0 || agg.refill_rate < 0.0 {
                    return invalid("rate_limit.aggregate limits are invalid".into());
                }
            }
        }
        if !(0.0..=1.0).contains(&self.breaker.failure_threshold) {
            return invalid("breaker.failure_threshold must be within 0.0..=1.0".into());
        }
        Ok(())
    }
}
