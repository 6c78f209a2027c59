//! Priority dequeue scheduler.
//!
//! Each (queue, priority) pair has a ready set scored by the job's
//! eligibility time, so a `not_before` in the future keeps a job out of
//! range until it is due and ties break by enqueue sequence. A dequeue
//! looks at the eligible head of every class, lets the starvation guard pick
//! one, and in the same transaction removes it from the ready set, writes
//! the claim, indexes the lease and advances the streak state.
//!
//! With several queues, each queue's pick is peeked first and the queue
//! offering the highest class is claimed from; ties go to the earlier queue
//! in the caller's list. Streak state stays per queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use spindle_core::clock::millis;
use spindle_core::{Claim, Clock, Job, JobId, Priority, StarvationGuard, StreakState, WorkerId};

use crate::codec::{encode, get_json, hget_json};
use crate::config::SchedulerConfig;
use crate::error::{QueueError, QueueResult};
use crate::keys::Keys;
use crate::retry::{make_ready, next_sequence};
use crate::store::{ScoreRange, Store, Txn};

/// Stale ready entries skipped per queue before giving up on it for this call.
const MAX_STALE_SKIPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    /// An earlier enqueue with the same idempotency key already created this job.
    pub duplicate: bool,
}

enum ClaimAttempt {
    Claimed(Box<Job>, Claim),
    Empty,
    Stale,
}

pub struct Scheduler<S> {
    store: S,
    keys: Keys,
    clock: Arc<dyn Clock>,
    guard: StarvationGuard,
    config: SchedulerConfig,
    idempotency_ttl: Duration,
}

impl<S: Store> Scheduler<S> {
    pub fn new(
        store: S,
        keys: Keys,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            guard: StarvationGuard::new(config.starvation_limit),
            config,
            idempotency_ttl,
        }
    }

    /// Job id previously enqueued under `idempotency_key`, if still remembered.
    pub fn find_duplicate(&self, queue: &str, idempotency_key: &str) -> QueueResult<Option<JobId>> {
        let key = self.keys.idempotency(queue, idempotency_key);
        self.store.transact(|txn| match txn.get(&key)? {
            Some(raw) => parse_job_id(&raw).map(Some),
            None => Ok(None),
        })
    }

    /// Write a validated job into its ready set.
    pub fn enqueue(&self, job: Job) -> QueueResult<EnqueueReceipt> {
        job.validate()?;
        let queue = job.queue.clone();
        let idem_key = job
            .idempotency_key
            .as_deref()
            .map(|k| self.keys.idempotency(&queue, k));

        let receipt = self.store.transact(|txn| {
            if let Some(key) = &idem_key {
                if let Some(raw) = txn.get(key)? {
                    return Ok(EnqueueReceipt {
                        job_id: parse_job_id(&raw)?,
                        duplicate: true,
                    });
                }
            }
            if txn.hget(&self.keys.jobs(&queue), &job.id.to_string())?.is_some() {
                return Err(QueueError::InvalidRequest(format!(
                    "job {} already exists in queue {}",
                    job.id, queue
                )));
            }

            let mut job = job.clone();
            job.sequence = next_sequence(txn, &self.keys, &queue)?;
            make_ready(txn, &self.keys, &job)?;
            if let Some(key) = &idem_key {
                txn.set(
                    key.as_str(),
                    job.id.to_string().into_bytes(),
                    Some(self.idempotency_ttl),
                );
            }
            Ok(EnqueueReceipt {
                job_id: job.id,
                duplicate: false,
            })
        })?;

        if receipt.duplicate {
            debug!(job_id = %receipt.job_id, queue = %queue, "duplicate enqueue collapsed by idempotency key");
        } else {
            info!(
                job_id = %receipt.job_id,
                queue = %queue,
                priority = %job.priority,
                not_before = ?job.not_before,
                max_attempts = job.max_attempts,
                "job enqueued"
            );
        }
        Ok(receipt)
    }

    /// Claim the highest-class eligible job across `queues` without waiting.
    pub fn try_dequeue(
        &self,
        worker_id: &WorkerId,
        queues: &[String],
        lease: Duration,
    ) -> QueueResult<Option<Job>> {
        let mut candidates = Vec::with_capacity(queues.len());
        for queue in queues {
            if let Some(pick) = self.peek(queue)? {
                candidates.push((pick, queue));
            }
        }
        // stable, so equal classes keep the caller's queue order
        candidates.sort_by_key(|(pick, _)| *pick);

        for (_, queue) in candidates {
            for _ in 0..MAX_STALE_SKIPS {
                match self.claim_from(queue, worker_id, lease)? {
                    ClaimAttempt::Claimed(job, claim) => {
                        info!(
                            job_id = %job.id,
                            queue = %queue,
                            priority = %job.priority,
                            worker_id = %worker_id,
                            attempt = job.attempt,
                            lease_expires_at = %claim.lease_expires_at,
                            "job claimed"
                        );
                        return Ok(Some(*job));
                    }
                    ClaimAttempt::Empty => break,
                    ClaimAttempt::Stale => continue,
                }
            }
        }
        Ok(None)
    }

    /// Class the starvation guard would pick from `queue` right now.
    fn peek(&self, queue: &str) -> QueueResult<Option<Priority>> {
        let streak_key = self.keys.streak(queue);
        self.store.transact(|txn| {
            let heads = self.ready_heads(txn, queue, self.clock.now())?;
            let available: Vec<Priority> = heads.iter().map(|(p, _)| *p).collect();
            let streak: StreakState = get_json(txn, &streak_key)?.unwrap_or_default();
            Ok(self.guard.select(&streak, &available))
        })
    }

    /// Eligible head member of each non-empty class, highest class first.
    fn ready_heads(
        &self,
        txn: &mut Txn<'_>,
        queue: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<(Priority, String)>> {
        let eligible = ScoreRange::up_to(millis(now));
        let mut heads = Vec::with_capacity(Priority::ALL.len());
        for priority in Priority::ALL {
            let head = txn
                .zrange_by_score(&self.keys.ready(queue, priority), eligible, 0, 1)?
                .into_iter()
                .next();
            if let Some((member, _)) = head {
                heads.push((priority, member));
            }
        }
        Ok(heads)
    }

    /// Like [`Scheduler::try_dequeue`], but waits up to `timeout` for work.
    pub fn dequeue(
        &self,
        worker_id: &WorkerId,
        queues: &[String],
        lease: Duration,
        timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        let deadline = Instant::now() + timeout;
        let notifications = self.store.capabilities().change_notifications;

        loop {
            if let Some(job) = self.try_dequeue(worker_id, queues, lease)? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // delayed jobs become due without any commit, so waits stay short
            let wait = (deadline - now).min(self.config.poll_interval);
            if notifications {
                self.store.wait_for_change(wait);
            } else {
                std::thread::sleep(wait);
            }
        }
    }

    fn claim_from(&self, queue: &str, worker_id: &WorkerId, lease: Duration) -> QueueResult<ClaimAttempt> {
        let streak_key = self.keys.streak(queue);
        let jobs_key = self.keys.jobs(queue);

        self.store.transact(|txn| {
            let now = self.clock.now();
            let heads = self.ready_heads(txn, queue, now)?;
            let available: Vec<Priority> = heads.iter().map(|(p, _)| *p).collect();
            let streak: StreakState = get_json(txn, &streak_key)?.unwrap_or_default();

            let Some(pick) = self.guard.select(&streak, &available) else {
                return Ok(ClaimAttempt::Empty);
            };
            let Some((_, member)) = heads.into_iter().find(|(p, _)| *p == pick) else {
                return Ok(ClaimAttempt::Empty);
            };
            let ready_key = self.keys.ready(queue, pick);

            let job = match Keys::parse_ready_member(&member) {
                Some(job_id) => hget_json::<Job>(txn, &jobs_key, &job_id.to_string())?,
                None => None,
            };
            let Some(job) = job else {
                debug!(queue = %queue, member = %member, "dropping stale ready entry");
                txn.zrem(ready_key, member);
                return Ok(ClaimAttempt::Stale);
            };

            let claim = Claim::new(job.id, worker_id.clone(), now, lease);
            let job_id = job.id.to_string();
            txn.zrem(ready_key, member);
            txn.hset(self.keys.claims(queue), job_id.as_str(), encode(&claim)?);
            txn.zadd(self.keys.leases(queue), job_id, millis(claim.lease_expires_at));
            txn.set(streak_key.as_str(), encode(&streak.after_pick(pick))?, None);

            Ok(ClaimAttempt::Claimed(Box::new(job), claim))
        })
    }
}

fn parse_job_id(raw: &[u8]) -> QueueResult<JobId> {
    std::str::from_utf8(raw)
        .map_err(|e| QueueError::Codec(e.to_string()))?
        .parse()
        .map_err(|e: spindle_core::DomainError| QueueError::Codec(e.to_string()))
}
