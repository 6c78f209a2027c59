//! Job executor: dequeue loop, handler dispatch and settlement.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use spindle_core::{Job, JobFailure, WorkerId};

use super::types::{ExecutorConfig, ExecutorStats, JobContext, JobHandler, JobResult};
use crate::error::{QueueError, QueueResult};
use crate::queue::JobQueue;
use crate::retry::FailOutcome;
use crate::store::Store;

/// Error class recorded when no handler is registered for a job's queue.
pub const NO_HANDLER: &str = "no_handler";
/// Error class recorded when a handler panics.
pub const HANDLER_PANIC: &str = "handler_panic";
/// Error class recorded when a handler stops on cancellation.
pub const CANCELLED: &str = "cancelled";

/// How a claimed job was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionOutcome {
    Succeeded,
    Retrying,
    DeadLettered,
    Cancelled,
    /// The claim was gone (reclaimed by the reaper) when we tried to settle.
    ClaimLost,
}

impl From<FailOutcome> for ExecutionOutcome {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::Retrying { .. } => ExecutionOutcome::Retrying,
            FailOutcome::DeadLettered { .. } => ExecutionOutcome::DeadLettered,
            FailOutcome::Cancelled => ExecutionOutcome::Cancelled,
        }
    }
}

/// Background job executor.
///
/// Dequeues from the configured queues, runs the handler registered for the
/// job's queue (falling back to `"*"`), and acks or fails the claim.
pub struct JobExecutor<S> {
    queue: Arc<JobQueue<S>>,
    handlers: HashMap<String, JobHandler<S>>,
}

impl<S: Store + Clone + Send + Sync + 'static> JobExecutor<S> {
    pub fn new(queue: Arc<JobQueue<S>>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a queue, or `"*"` for every queue without one.
    pub fn register_handler<F>(&mut self, queue: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext<'_, S>) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(queue.into(), Box::new(handler));
    }

    fn handler_for(&self, queue: &str) -> Option<&JobHandler<S>> {
        self.handlers.get(queue).or_else(|| self.handlers.get("*"))
    }

    /// Run one already-claimed job and settle its claim.
    pub fn execute_one(&self, worker_id: &WorkerId, job: &Job) -> QueueResult<ExecutionOutcome> {
        self.execute_with(worker_id, job, &AtomicBool::new(false))
    }

    fn execute_with(
        &self,
        worker_id: &WorkerId,
        job: &Job,
        claim_lost: &AtomicBool,
    ) -> QueueResult<ExecutionOutcome> {
        let ctx = JobContext {
            queue: &self.queue,
            job,
            worker_id,
            claim_lost,
        };

        let result = match self.handler_for(&job.queue) {
            Some(handler) => panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx))).unwrap_or_else(|_| {
                error!(job_id = %job.id, queue = %job.queue, worker_id = %worker_id, "job handler panicked");
                JobResult::failure(HANDLER_PANIC, "handler panicked")
            }),
            None => {
                warn!(job_id = %job.id, queue = %job.queue, "no handler for job");
                JobResult::failure(NO_HANDLER, format!("no handler for queue {}", job.queue))
            }
        };

        self.settle(worker_id, job, result)
    }

    fn settle(&self, worker_id: &WorkerId, job: &Job, result: JobResult) -> QueueResult<ExecutionOutcome> {
        let settled = match result {
            JobResult::Success => self
                .queue
                .ack(&job.queue, job.id, worker_id)
                .map(|_| ExecutionOutcome::Succeeded),
            JobResult::Failure(failure) => self
                .queue
                .fail(&job.queue, job.id, worker_id, &failure)
                .map(ExecutionOutcome::from),
            JobResult::Cancelled => {
                let failure = JobFailure::new(CANCELLED, "handler stopped on cancellation");
                self.queue
                    .fail(&job.queue, job.id, worker_id, &failure)
                    .map(ExecutionOutcome::from)
            }
        };

        match settled {
            Err(QueueError::ClaimConflict { .. }) => {
                warn!(job_id = %job.id, queue = %job.queue, worker_id = %worker_id, "claim lost before settlement");
                Ok(ExecutionOutcome::ClaimLost)
            }
            other => other,
        }
    }

    /// Spawn `config.concurrency` worker threads.
    pub fn spawn(self, config: ExecutorConfig) -> QueueResult<JobExecutorHandle> {
        if config.queues.is_empty() {
            return Err(QueueError::Config("executor needs at least one queue".into()));
        }
        if config.concurrency == 0 {
            return Err(QueueError::Config("executor concurrency must be at least 1".into()));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(QueueError::Config("heartbeat interval must be positive".into()));
        }
        if config.heartbeat_interval >= config.lease {
            return Err(QueueError::Config(format!(
                "heartbeat interval {:?} must be shorter than the lease {:?}",
                config.heartbeat_interval, config.lease
            )));
        }

        let executor = Arc::new(self);
        let config = Arc::new(config);
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let mut workers = Vec::with_capacity(config.concurrency);
        let mut joins = Vec::with_capacity(config.concurrency);

        for slot in 0..config.concurrency {
            let worker_id = WorkerId::for_process(&config.worker_prefix, slot);
            let (w_executor, w_config, w_stop, w_stats, w_id) =
                (executor.clone(), config.clone(), stop.clone(), stats.clone(), worker_id.clone());

            let spawned = thread::Builder::new()
                .name(format!("{}-{slot}", config.name))
                .spawn(move || worker_loop(&w_executor, &w_config, w_id, &w_stop, &w_stats));

            match spawned {
                Ok(join) => {
                    workers.push(worker_id);
                    joins.push(join);
                }
                Err(e) => {
                    stop.store(true, Ordering::Release);
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(QueueError::Config(format!("failed to spawn worker thread: {e}")));
                }
            }
        }

        info!(
            executor = %config.name,
            workers = config.concurrency,
            queues = ?config.queues,
            "job executor started"
        );

        Ok(JobExecutorHandle {
            stop,
            joins,
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

fn lock_stats(stats: &Mutex<ExecutorStats>) -> std::sync::MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

fn worker_loop<S: Store + Clone + Send + Sync + 'static>(
    executor: &JobExecutor<S>,
    config: &ExecutorConfig,
    worker_id: WorkerId,
    stop: &AtomicBool,
    stats: &Mutex<ExecutorStats>,
) {
    let queue = &executor.queue;
    info!(executor = %config.name, worker_id = %worker_id, "worker started");

    if let Err(e) = queue.heartbeat(&worker_id, None) {
        warn!(worker_id = %worker_id, error = %e, "heartbeat failed");
    }
    let mut last_beat = Instant::now();

    while !stop.load(Ordering::Acquire) {
        match queue.is_draining(&worker_id) {
            Ok(true) => {
                info!(executor = %config.name, worker_id = %worker_id, "drain signalled; worker exiting");
                break;
            }
            Ok(false) => {}
            Err(e) => {
                back_off(config, &worker_id, &e);
                continue;
            }
        }

        if last_beat.elapsed() >= config.heartbeat_interval {
            if let Err(e) = queue.heartbeat(&worker_id, None) {
                warn!(worker_id = %worker_id, error = %e, "heartbeat failed");
            }
            last_beat = Instant::now();
        }

        match queue.dequeue_timeout(&worker_id, &config.queues, config.lease, config.poll_timeout) {
            Ok(Some(job)) => {
                debug!(
                    executor = %config.name,
                    worker_id = %worker_id,
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempt,
                    "claimed job"
                );
                run_claimed(executor, config, &worker_id, &job, stats);
                last_beat = Instant::now();
            }
            Ok(None) => {}
            Err(e) => back_off(config, &worker_id, &e),
        }
    }

    if let Err(e) = queue.deregister_worker(&worker_id) {
        warn!(worker_id = %worker_id, error = %e, "failed to remove heartbeat on exit");
    }
    info!(executor = %config.name, worker_id = %worker_id, "worker stopped");
}

fn back_off(config: &ExecutorConfig, worker_id: &WorkerId, e: &QueueError) {
    match e {
        QueueError::CircuitOpen => {
            debug!(worker_id = %worker_id, "store circuit open; pausing");
        }
        other => {
            error!(executor = %config.name, worker_id = %worker_id, error = %other, "queue call failed");
        }
    }
    thread::sleep(config.circuit_pause);
}

/// Run a claimed job while a scoped thread keeps the heartbeat and the lease
/// fresh. A renewal that finds the claim gone raises the handler's
/// claim-lost flag and stops the thread.
fn run_claimed<S: Store + Clone + Send + Sync + 'static>(
    executor: &JobExecutor<S>,
    config: &ExecutorConfig,
    worker_id: &WorkerId,
    job: &Job,
    stats: &Mutex<ExecutorStats>,
) {
    lock_stats(stats).current_running += 1;
    let claim_lost = AtomicBool::new(false);

    let outcome = thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let interval = config.heartbeat_interval;
        let queue = &executor.queue;
        let lost = &claim_lost;

        if let Err(e) = queue.heartbeat(worker_id, Some(job.id)) {
            warn!(worker_id = %worker_id, error = %e, "heartbeat failed");
        }
        scope.spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(interval) {
                if let Err(e) = queue.heartbeat(worker_id, Some(job.id)) {
                    warn!(worker_id = %worker_id, error = %e, "heartbeat failed");
                }
                match queue.renew(&job.queue, job.id, worker_id) {
                    Ok(_) => {}
                    Err(QueueError::ClaimConflict { .. }) => {
                        warn!(job_id = %job.id, queue = %job.queue, worker_id = %worker_id, "lease lost while running");
                        lost.store(true, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, worker_id = %worker_id, error = %e, "lease renewal failed");
                    }
                }
            }
        });

        let outcome = executor.execute_with(worker_id, job, &claim_lost);
        drop(done_tx);
        outcome
    });

    let mut s = lock_stats(stats);
    s.current_running = s.current_running.saturating_sub(1);
    s.jobs_processed += 1;
    match outcome {
        Ok(ExecutionOutcome::Succeeded) => s.jobs_succeeded += 1,
        Ok(ExecutionOutcome::Retrying) => s.jobs_failed += 1,
        Ok(ExecutionOutcome::DeadLettered) => {
            s.jobs_failed += 1;
            s.jobs_dead_lettered += 1;
        }
        Ok(ExecutionOutcome::Cancelled) => s.jobs_cancelled += 1,
        Ok(ExecutionOutcome::ClaimLost) => s.claims_lost += 1,
        Err(e) => {
            s.jobs_failed += 1;
            error!(
                executor = %config.name,
                worker_id = %worker_id,
                job_id = %job.id,
                error = %e,
                "failed to settle job; the reaper will reclaim it"
            );
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    stop: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    workers: Vec<WorkerId>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Worker ids, one per thread, in slot order.
    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.workers
    }

    /// Whether any worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.joins.iter().any(|j| !j.is_finished())
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop taking new jobs, let running jobs settle, and wait for the threads.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }

    /// Wait up to `timeout` for every worker to exit on its own (e.g. after a drain).
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}
