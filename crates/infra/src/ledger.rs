//! Claim ledger: ack, renew, fail and cancellation.
//!
//! Claims are partitioned per queue, so each operation addresses a job by
//! (queue, job id). Every operation checks claim ownership and mutates in
//! the same transaction; a caller that no longer owns the claim gets
//! [`QueueError::ClaimConflict`] and nothing changes.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use spindle_core::clock::millis;
use spindle_core::{Claim, Clock, FailureReason, Job, JobFailure, JobId, RetryPolicy, WorkerId};

use crate::codec::{encode, hget_json};
use crate::error::{QueueError, QueueResult};
use crate::keys::Keys;
use crate::retry::{FailOutcome, apply_failure, clear_claim, discard_job};
use crate::store::{Store, Txn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Acked,
    /// Nothing left to ack; an earlier ack already removed the job.
    AlreadyAcked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was still ready and has been removed.
    Removed,
    /// The job is claimed; its worker will see the marker at its next checkpoint.
    Signalled,
    NotFound,
}

fn conflict(job_id: JobId, worker_id: &WorkerId) -> QueueError {
    QueueError::ClaimConflict {
        job_id,
        worker_id: worker_id.clone(),
    }
}

/// The caller's claim, or `ClaimConflict` if someone else holds it.
fn owned_claim(
    txn: &mut Txn<'_>,
    keys: &Keys,
    queue: &str,
    job_id: JobId,
    worker_id: &WorkerId,
) -> QueueResult<Option<Claim>> {
    match hget_json::<Claim>(txn, &keys.claims(queue), &job_id.to_string())? {
        Some(claim) if claim.is_owned_by(worker_id) => Ok(Some(claim)),
        Some(_) => Err(conflict(job_id, worker_id)),
        None => Ok(None),
    }
}

pub struct ClaimLedger<S> {
    store: S,
    keys: Keys,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl<S: Store> ClaimLedger<S> {
    pub fn new(store: S, keys: Keys, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            store,
            keys,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Success path: clear the claim and discard the job.
    ///
    /// Acking a job that is already gone is a no-op. Acking a job that still
    /// exists without a claim from `worker_id` (reclaimed, re-claimed by
    /// another worker, or dead-lettered) is a conflict.
    pub fn ack(&self, queue: &str, job_id: JobId, worker_id: &WorkerId) -> QueueResult<AckOutcome> {
        let jobs_key = self.keys.jobs(queue);
        let dlq_key = self.keys.dead_letters(queue);
        let id = job_id.to_string();

        let outcome = self.store.transact(|txn| {
            match owned_claim(txn, &self.keys, queue, job_id, worker_id)? {
                Some(claim) => {
                    let job: Option<Job> = hget_json(txn, &jobs_key, &id)?;
                    clear_claim(txn, &self.keys, queue, &claim);
                    match job {
                        Some(job) => discard_job(txn, &self.keys, &job),
                        None => {
                            txn.hdel(jobs_key.as_str(), id.as_str());
                            txn.del(self.keys.cancellation(queue, job_id));
                        }
                    }
                    Ok(AckOutcome::Acked)
                }
                None => {
                    let still_tracked = txn.hget(&jobs_key, &id)?.is_some()
                        || txn.hget(&dlq_key, &id)?.is_some();
                    if still_tracked {
                        Err(conflict(job_id, worker_id))
                    } else {
                        Ok(AckOutcome::AlreadyAcked)
                    }
                }
            }
        })?;

        match outcome {
            AckOutcome::Acked => {
                info!(job_id = %job_id, queue = %queue, worker_id = %worker_id, "job acked")
            }
            AckOutcome::AlreadyAcked => {
                debug!(job_id = %job_id, queue = %queue, worker_id = %worker_id, "ack for a job that is already gone")
            }
        }
        Ok(outcome)
    }

    /// Extend the caller's lease by its original length from now.
    pub fn renew(&self, queue: &str, job_id: JobId, worker_id: &WorkerId) -> QueueResult<Claim> {
        let claim = self.store.transact(|txn| -> QueueResult<Claim> {
            let claim = owned_claim(txn, &self.keys, queue, job_id, worker_id)?
                .ok_or_else(|| conflict(job_id, worker_id))?;
            let renewed = claim.renewed(self.clock.now());
            let id = job_id.to_string();
            txn.hset(self.keys.claims(queue), id.as_str(), encode(&renewed)?);
            txn.zadd(self.keys.leases(queue), id, millis(renewed.lease_expires_at));
            Ok(renewed)
        })?;

        debug!(
            job_id = %job_id,
            queue = %queue,
            worker_id = %worker_id,
            lease_expires_at = %claim.lease_expires_at,
            "lease renewed"
        );
        Ok(claim)
    }

    /// Failure path: clear the claim and hand the job to the retry policy.
    pub fn fail(
        &self,
        queue: &str,
        job_id: JobId,
        worker_id: &WorkerId,
        failure: &JobFailure,
    ) -> QueueResult<FailOutcome> {
        let jobs_key = self.keys.jobs(queue);
        let cancel_key = self.keys.cancellation(queue, job_id);
        let id = job_id.to_string();

        self.store.transact(|txn| {
            let claim = owned_claim(txn, &self.keys, queue, job_id, worker_id)?
                .ok_or_else(|| conflict(job_id, worker_id))?;
            let job: Job = hget_json(txn, &jobs_key, &id)?
                .ok_or_else(|| QueueError::NotFound(format!("job {job_id} in queue {queue}")))?;
            let cancelled = txn.get(&cancel_key)?.is_some();
            apply_failure(
                txn,
                &self.keys,
                &self.policy,
                job,
                &claim,
                FailureReason::WorkerError,
                failure,
                cancelled,
                self.clock.now(),
            )
        })
    }

    /// Administrative cancel. Ready jobs are removed outright; claimed jobs
    /// get a marker their worker polls through [`ClaimLedger::is_cancelled`].
    pub fn cancel(&self, queue: &str, job_id: JobId) -> QueueResult<CancelOutcome> {
        let id = job_id.to_string();
        let outcome = self.store.transact(|txn| -> QueueResult<CancelOutcome> {
            let Some(job) = hget_json::<Job>(txn, &self.keys.jobs(queue), &id)? else {
                return Ok(CancelOutcome::NotFound);
            };
            if txn.hget(&self.keys.claims(queue), &id)?.is_some() {
                txn.set(self.keys.cancellation(queue, job_id), b"1".to_vec(), None);
                Ok(CancelOutcome::Signalled)
            } else {
                discard_job(txn, &self.keys, &job);
                Ok(CancelOutcome::Removed)
            }
        })?;

        info!(job_id = %job_id, queue = %queue, outcome = ?outcome, "cancel requested");
        Ok(outcome)
    }

    pub fn is_cancelled(&self, queue: &str, job_id: JobId) -> QueueResult<bool> {
        let key = self.keys.cancellation(queue, job_id);
        self.store
            .transact(|txn| Ok::<_, QueueError>(txn.get(&key)?.is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;
    use crate::store::InMemoryStore;
    use spindle_core::{DeadLetterCause, ManualClock, Priority};

    struct Fixture {
        clock: ManualClock,
        scheduler: Scheduler<Arc<InMemoryStore>>,
        ledger: ClaimLedger<Arc<InMemoryStore>>,
    }

    fn fixture(policy: RetryPolicy) -> Fixture {
        let clock = ManualClock::starting_now();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryStore::with_clock(clock_arc.clone()));
        Fixture {
            scheduler: Scheduler::new(
                store.clone(),
                Keys::default(),
                clock_arc.clone(),
                SchedulerConfig::default(),
                Duration::from_secs(60),
            ),
            ledger: ClaimLedger::new(store, Keys::default(), clock_arc, policy),
            clock,
        }
    }

    impl Fixture {
        fn enqueue_and_claim(&self, worker: &WorkerId) -> Job {
            self.scheduler
                .enqueue(Job::new("q", Priority::Normal, vec![1], self.clock.now()))
                .unwrap();
            self.scheduler
                .try_dequeue(worker, &["q".to_string()], Duration::from_secs(30))
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn ack_is_idempotent() {
        let f = fixture(RetryPolicy::default());
        let w = WorkerId::new("w1");
        let job = f.enqueue_and_claim(&w);

        assert_eq!(f.ledger.ack("q", job.id, &w).unwrap(), AckOutcome::Acked);
        assert_eq!(f.ledger.ack("q", job.id, &w).unwrap(), AckOutcome::AlreadyAcked);
    }

    #[test]
    fn non_owner_is_rejected_everywhere() {
        let f = fixture(RetryPolicy::default());
        let owner = WorkerId::new("owner");
        let intruder = WorkerId::new("intruder");
        let job = f.enqueue_and_claim(&owner);

        let is_conflict = |r: QueueError| matches!(r, QueueError::ClaimConflict { .. });
        assert!(is_conflict(f.ledger.ack("q", job.id, &intruder).unwrap_err()));
        assert!(is_conflict(f.ledger.renew("q", job.id, &intruder).unwrap_err()));
        assert!(is_conflict(
            f.ledger
                .fail("q", job.id, &intruder, &JobFailure::new("io", "boom"))
                .unwrap_err()
        ));

        // the owner's claim survived untouched
        assert_eq!(f.ledger.ack("q", job.id, &owner).unwrap(), AckOutcome::Acked);
    }

    #[test]
    fn renew_pushes_lease_forward() {
        let f = fixture(RetryPolicy::default());
        let w = WorkerId::new("w1");
        let job = f.enqueue_and_claim(&w);

        f.clock.advance(Duration::from_secs(20));
        let claim = f.ledger.renew("q", job.id, &w).unwrap();
        assert_eq!(claim.lease_expires_at, f.clock.now() + chrono::Duration::seconds(30));
    }

    #[test]
    fn fail_schedules_a_delayed_retry() {
        let f = fixture(RetryPolicy::fixed(3, Duration::from_secs(5)));
        let w = WorkerId::new("w1");
        let job = f.enqueue_and_claim(&w);

        let outcome = f
            .ledger
            .fail("q", job.id, &w, &JobFailure::new("timeout", "slow"))
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));

        let queues = vec!["q".to_string()];
        assert!(f.scheduler.try_dequeue(&w, &queues, Duration::from_secs(30)).unwrap().is_none());
        f.clock.advance(Duration::from_secs(5));
        let again = f.scheduler.try_dequeue(&w, &queues, Duration::from_secs(30)).unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempt, 1);
        assert_eq!(again.history.len(), 1);
    }

    #[test]
    fn non_retryable_failure_dead_letters_at_once() {
        let f = fixture(RetryPolicy::default().with_non_retryable("payload_validation"));
        let w = WorkerId::new("w1");
        let job = f.enqueue_and_claim(&w);

        let outcome = f
            .ledger
            .fail("q", job.id, &w, &JobFailure::new("payload_validation", "bad json"))
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::DeadLettered {
                attempt: 1,
                cause: DeadLetterCause::PolicyViolation
            }
        );
        // a late ack from the same worker must not look like success
        assert!(matches!(
            f.ledger.ack("q", job.id, &w),
            Err(QueueError::ClaimConflict { .. })
        ));
    }

    #[test]
    fn cancel_ready_job_removes_it() {
        let f = fixture(RetryPolicy::default());
        let id = f
            .scheduler
            .enqueue(Job::new("q", Priority::Low, vec![], f.clock.now()))
            .unwrap()
            .job_id;

        assert_eq!(f.ledger.cancel("q", id).unwrap(), CancelOutcome::Removed);
        assert_eq!(f.ledger.cancel("q", id).unwrap(), CancelOutcome::NotFound);
        let w = WorkerId::new("w");
        assert!(f
            .scheduler
            .try_dequeue(&w, &["q".to_string()], Duration::from_secs(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn cancel_claimed_job_is_cooperative() {
        let f = fixture(RetryPolicy::default());
        let w = WorkerId::new("w1");
        let job = f.enqueue_and_claim(&w);

        assert_eq!(f.ledger.cancel("q", job.id).unwrap(), CancelOutcome::Signalled);
        assert!(f.ledger.is_cancelled("q", job.id).unwrap());

        let outcome = f
            .ledger
            .fail("q", job.id, &w, &JobFailure::new("cancelled", "stopped at checkpoint"))
            .unwrap();
        assert_eq!(outcome, FailOutcome::Cancelled);
        assert!(!f.ledger.is_cancelled("q", job.id).unwrap());
    }
}
