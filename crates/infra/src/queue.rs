//! `JobQueue`: the public surface producers, workers and operators call.
//!
//! Every store interaction goes through the circuit breaker, so a store
//! outage turns into fast `CircuitOpen` failures instead of piling up
//! blocked callers.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use spindle_core::clock::checked_add;
use spindle_core::{
    Claim, Clock, DeadLetterEntry, Job, JobFailure, JobId, Priority, SystemClock, WorkerHeartbeat,
    WorkerId,
};

use crate::breaker::CircuitBreaker;
use crate::config::QueueConfig;
use crate::dead_letter::{DeadLetters, PurgeTarget, RequeueReport};
use crate::error::{QueueError, QueueResult};
use crate::fleet::Fleet;
use crate::keys::Keys;
use crate::ledger::{AckOutcome, CancelOutcome, ClaimLedger};
use crate::rate_limiter::{BucketSnapshot, RateLimiter};
use crate::reaper::Reaper;
use crate::retry::FailOutcome;
use crate::scheduler::{EnqueueReceipt, Scheduler};
use crate::store::Store;

/// Per-enqueue options.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    /// Producer-assigned id; a UUIDv7 is generated otherwise.
    pub job_id: Option<JobId>,
    pub max_attempts: Option<u32>,
    /// Relative delay before the job becomes eligible.
    pub delay: Option<Duration>,
    /// Absolute earliest dequeue time; the later of this and `delay` wins.
    pub not_before: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    /// Rate-limit scope prefix (e.g. a tenant); the queue name is appended.
    pub tenant: Option<String>,
    /// Tokens charged against the rate limiter.
    pub cost: f64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            max_attempts: None,
            delay: None,
            not_before: None,
            idempotency_key: None,
            tenant: None,
            cost: 1.0,
        }
    }
}

impl EnqueueOptions {
    pub fn with_job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Queue depth and limiter state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    /// Ready jobs, including ones not yet due.
    pub ready_count: u64,
    pub ready_by_priority: BTreeMap<Priority, u64>,
    pub claimed_count: u64,
    pub dlq_count: u64,
    pub rate_limit: Vec<BucketSnapshot>,
}

pub struct JobQueue<S> {
    store: S,
    keys: Keys,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter<S>,
    scheduler: Scheduler<S>,
    ledger: ClaimLedger<S>,
    dead_letters: DeadLetters<S>,
    fleet: Fleet<S>,
    registered: Mutex<HashSet<String>>,
}

impl<S: Store + Clone> JobQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> QueueResult<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: QueueConfig, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        config.validate()?;
        let keys = Keys::new(config.namespace.clone());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), clock.clone()));

        Ok(Self {
            limiter: RateLimiter::new(
                store.clone(),
                keys.clone(),
                config.rate_limit.clone(),
                clock.clone(),
                breaker.clone(),
            ),
            scheduler: Scheduler::new(
                store.clone(),
                keys.clone(),
                clock.clone(),
                config.scheduler.clone(),
                config.idempotency_ttl,
            ),
            ledger: ClaimLedger::new(store.clone(), keys.clone(), clock.clone(), config.retry.clone()),
            dead_letters: DeadLetters::new(store.clone(), keys.clone(), clock.clone()),
            fleet: Fleet::new(store.clone(), keys.clone(), clock.clone(), config.fleet.clone()),
            store,
            keys,
            config,
            clock,
            breaker,
            registered: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// A reaper over the same store and policies.
    pub fn reaper(&self) -> Reaper<S> {
        Reaper::new(
            self.store.clone(),
            self.keys.clone(),
            self.clock.clone(),
            self.config.retry.clone(),
            self.config.reaper.clone(),
        )
    }

    /// Fleet control over the same store, for running alongside a reaper.
    pub fn fleet(&self) -> Fleet<S> {
        Fleet::new(
            self.store.clone(),
            self.keys.clone(),
            self.clock.clone(),
            self.config.fleet.clone(),
        )
    }

    fn guarded<T>(&self, f: impl FnOnce() -> QueueResult<T>) -> QueueResult<T> {
        self.breaker.call(f)
    }

    fn register_queue(&self, queue: &str) -> QueueResult<()> {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        if registered.contains(queue) {
            return Ok(());
        }
        let key = self.keys.queues();
        self.guarded(|| {
            self.store.transact(|txn| -> QueueResult<()> {
                txn.hset(key.as_str(), queue, b"1".to_vec());
                Ok(())
            })
        })?;
        registered.insert(queue.to_string());
        Ok(())
    }

    /// Admit and enqueue a job. Returns `RateLimited` when admission is denied.
    pub fn enqueue(
        &self,
        queue: &str,
        priority: Priority,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> QueueResult<EnqueueReceipt> {
        let now = self.clock.now();
        let mut job = Job::new(queue, priority, payload, now)
            .with_max_attempts(opts.max_attempts.unwrap_or(self.config.retry.max_attempts));
        if let Some(id) = opts.job_id {
            job = job.with_id(id);
        }
        let delayed_until = opts
            .delay
            .map(|d| {
                checked_add(now, d).ok_or_else(|| {
                    QueueError::InvalidRequest(format!("delay of {d:?} is out of range"))
                })
            })
            .transpose()?;
        if let Some(at) = delayed_until.into_iter().chain(opts.not_before).max() {
            job = job.with_not_before(at);
        }
        if let Some(key) = &opts.idempotency_key {
            if key.is_empty() {
                return Err(QueueError::InvalidRequest("idempotency key must not be empty".into()));
            }
            job = job.with_idempotency_key(key.clone());
        }
        job.validate()?;

        if let Some(key) = &opts.idempotency_key {
            if let Some(existing) = self.guarded(|| self.scheduler.find_duplicate(queue, key))? {
                debug!(job_id = %existing, queue = %queue, "idempotent enqueue; admission skipped");
                return Ok(EnqueueReceipt {
                    job_id: existing,
                    duplicate: true,
                });
            }
        }

        let scope = rate_scope(queue, opts.tenant.as_deref());
        let admission = self.limiter.try_acquire(&scope, priority, opts.cost)?;
        if !admission.allowed {
            return Err(QueueError::RateLimited {
                retry_after: admission.retry_after,
            });
        }

        self.register_queue(queue)?;
        self.guarded(|| self.scheduler.enqueue(job))
    }

    /// Blocking dequeue with the configured timeout.
    pub fn dequeue(&self, worker_id: &WorkerId, queues: &[String], lease: Duration) -> QueueResult<Option<Job>> {
        self.dequeue_timeout(worker_id, queues, lease, self.config.scheduler.dequeue_timeout)
    }

    pub fn dequeue_timeout(
        &self,
        worker_id: &WorkerId,
        queues: &[String],
        lease: Duration,
        timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        self.check_lease(lease)?;
        self.guarded(|| self.scheduler.dequeue(worker_id, queues, lease, timeout))
    }

    pub fn try_dequeue(&self, worker_id: &WorkerId, queues: &[String], lease: Duration) -> QueueResult<Option<Job>> {
        self.check_lease(lease)?;
        self.guarded(|| self.scheduler.try_dequeue(worker_id, queues, lease))
    }

    fn check_lease(&self, lease: Duration) -> QueueResult<()> {
        if lease.is_zero() || lease > self.config.lease.max_duration {
            return Err(QueueError::InvalidRequest(format!(
                "lease {lease:?} must be positive and at most {:?}",
                self.config.lease.max_duration
            )));
        }
        Ok(())
    }

    pub fn ack(&self, queue: &str, job_id: JobId, worker_id: &WorkerId) -> QueueResult<AckOutcome> {
        self.guarded(|| self.ledger.ack(queue, job_id, worker_id))
    }

    pub fn renew(&self, queue: &str, job_id: JobId, worker_id: &WorkerId) -> QueueResult<Claim> {
        self.guarded(|| self.ledger.renew(queue, job_id, worker_id))
    }

    pub fn fail(
        &self,
        queue: &str,
        job_id: JobId,
        worker_id: &WorkerId,
        failure: &JobFailure,
    ) -> QueueResult<FailOutcome> {
        self.guarded(|| self.ledger.fail(queue, job_id, worker_id, failure))
    }

    pub fn cancel(&self, queue: &str, job_id: JobId) -> QueueResult<CancelOutcome> {
        self.guarded(|| self.ledger.cancel(queue, job_id))
    }

    pub fn is_cancelled(&self, queue: &str, job_id: JobId) -> QueueResult<bool> {
        self.guarded(|| self.ledger.is_cancelled(queue, job_id))
    }

    /// Counts for `queue` plus the queue-wide rate-limit buckets. Jobs
    /// enqueued with a tenant are admitted against per-tenant buckets; use
    /// [`JobQueue::stats_for_tenant`] to see those.
    pub fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.stats_in_scope(queue, None)
    }

    /// Like [`JobQueue::stats`], with the rate-limit snapshot taken from the
    /// tenant's buckets for this queue.
    pub fn stats_for_tenant(&self, queue: &str, tenant: &str) -> QueueResult<QueueStats> {
        self.stats_in_scope(queue, Some(tenant))
    }

    fn stats_in_scope(&self, queue: &str, tenant: Option<&str>) -> QueueResult<QueueStats> {
        let claims_key = self.keys.claims(queue);
        let dlq_key = self.keys.dead_letters(queue);
        let ready_keys: Vec<(Priority, String)> = Priority::ALL
            .iter()
            .map(|p| (*p, self.keys.ready(queue, *p)))
            .collect();

        let (ready_by_priority, claimed_count, dlq_count) = self.guarded(|| {
            self.store.transact(|txn| {
                let mut ready = BTreeMap::new();
                for (priority, key) in &ready_keys {
                    ready.insert(*priority, txn.zcard(key)?);
                }
                Ok::<_, QueueError>((ready, txn.hlen(&claims_key)?, txn.hlen(&dlq_key)?))
            })
        })?;
        let rate_limit = self.limiter.snapshot(&rate_scope(queue, tenant))?;

        Ok(QueueStats {
            queue: queue.to_string(),
            ready_count: ready_by_priority.values().sum(),
            ready_by_priority,
            claimed_count,
            dlq_count,
            rate_limit,
        })
    }

    pub fn peek_dlq(&self, queue: &str, offset: usize, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        self.guarded(|| self.dead_letters.peek(queue, offset, limit))
    }

    pub fn requeue_dlq(&self, queue: &str, ids: &[JobId]) -> QueueResult<RequeueReport> {
        self.guarded(|| self.dead_letters.requeue(queue, ids))
    }

    pub fn purge_dlq(&self, queue: &str, target: &PurgeTarget) -> QueueResult<u64> {
        self.guarded(|| self.dead_letters.purge(queue, target))
    }

    pub fn heartbeat(&self, worker_id: &WorkerId, current_job_id: Option<JobId>) -> QueueResult<WorkerHeartbeat> {
        self.guarded(|| self.fleet.heartbeat(worker_id, current_job_id))
    }

    pub fn list_heartbeats(&self) -> QueueResult<Vec<WorkerHeartbeat>> {
        self.guarded(|| self.fleet.list())
    }

    pub fn deregister_worker(&self, worker_id: &WorkerId) -> QueueResult<()> {
        self.guarded(|| self.fleet.remove(worker_id))
    }

    pub fn signal_drain(&self, worker_id: &WorkerId) -> QueueResult<()> {
        self.guarded(|| self.fleet.signal_drain(worker_id))
    }

    pub fn is_draining(&self, worker_id: &WorkerId) -> QueueResult<bool> {
        self.guarded(|| self.fleet.is_draining(worker_id))
    }
}

/// Rate-limit scope for a queue, narrowed to a tenant when one is given.
fn rate_scope(queue: &str, tenant: Option<&str>) -> String {
    match tenant {
        Some(tenant) => format!("{tenant}:{queue}"),
        None => queue.to_string(),
    }
}
