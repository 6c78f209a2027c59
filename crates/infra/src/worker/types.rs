//! Worker runtime types: handler results, handler context, configuration
//! and counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use spindle_core::{Claim, Job, JobFailure, WorkerId};

use crate::error::{QueueError, QueueResult};
use crate::queue::JobQueue;
use crate::store::Store;

/// Outcome a handler reports for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed; the claim is acked.
    Success,
    /// Job failed; the retry policy decides between retry and dead-letter.
    Failure(JobFailure),
    /// The handler saw the cancellation flag and stopped early.
    Cancelled,
}

impl JobResult {
    pub fn failure(class: impl Into<String>, message: impl Into<String>) -> Self {
        JobResult::Failure(JobFailure::new(class, message))
    }
}

/// What a handler sees while it runs a job.
pub struct JobContext<'a, S> {
    pub(crate) queue: &'a JobQueue<S>,
    pub(crate) job: &'a Job,
    pub(crate) worker_id: &'a WorkerId,
    /// Set once a renewal finds the claim owned elsewhere or gone.
    pub(crate) claim_lost: &'a AtomicBool,
}

impl<S: Store + Clone> JobContext<'_, S> {
    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn payload(&self) -> &[u8] {
        &self.job.payload
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.worker_id
    }

    /// Extend the lease for long-running work. The executor already renews
    /// on every heartbeat; this is for handlers run outside of it.
    pub fn renew(&self) -> QueueResult<Claim> {
        let renewed = self.queue.renew(&self.job.queue, self.job.id, self.worker_id);
        if let Err(QueueError::ClaimConflict { .. }) = renewed {
            self.claim_lost.store(true, Ordering::Release);
        }
        renewed
    }

    /// True once the lease was reclaimed or the claim settled elsewhere.
    /// Results reported after this are discarded, so handlers should stop.
    pub fn is_claim_lost(&self) -> bool {
        self.claim_lost.load(Ordering::Acquire)
    }

    /// Cancellation checkpoint. Handlers poll this between units of work.
    pub fn is_cancelled(&self) -> QueueResult<bool> {
        self.queue.is_cancelled(&self.job.queue, self.job.id)
    }
}

pub type JobHandler<S> = Box<dyn Fn(&JobContext<'_, S>) -> JobResult + Send + Sync>;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Name for logging
    pub name: String,
    /// Worker ids are `{worker_prefix}-{slot}`
    pub worker_prefix: String,
    /// Queues to dequeue from
    pub queues: Vec<String>,
    /// Lease per claim; renewed every `heartbeat_interval` while the handler runs
    pub lease: Duration,
    /// Worker threads, one claim each
    pub concurrency: usize,
    /// Blocking dequeue wait per loop iteration
    pub poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Back-off while the circuit breaker is open
    pub circuit_pause: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "spindle-executor".to_string(),
            worker_prefix: "worker".to_string(),
            queues: Vec::new(),
            lease: Duration::from_secs(30),
            concurrency: 1,
            poll_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            circuit_pause: Duration::from_secs(1),
        }
    }
}

impl ExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn with_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_cancelled: u64,
    /// Acks or fails rejected because the lease had already been reclaimed.
    pub claims_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}
