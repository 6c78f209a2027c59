//! Reaper: reclaims claims whose lease expired.
//!
//! Each tick walks the known queues starting at a cursor, pulling at most
//! `batch_size` expired entries from the lease indexes in total. The cursor
//! resumes where the previous tick ran out of budget, so a backlog in one
//! queue cannot starve the others. Every reclaim is its own transaction that
//! re-reads the claim: an ack or renew that landed after the scan wins.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use spindle_core::clock::millis;
use spindle_core::{Claim, Clock, FailureReason, Job, JobFailure, JobId, RetryPolicy};

use crate::codec::hget_json;
use crate::config::ReaperConfig;
use crate::error::{QueueError, QueueResult};
use crate::fleet::Fleet;
use crate::keys::Keys;
use crate::retry::{FailOutcome, apply_failure, clear_claim};
use crate::store::{ScoreRange, Store};

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub queues_scanned: usize,
    pub expired_found: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
    /// Index entries whose claim was already gone or renewed.
    pub skipped: usize,
}

enum Reclaim {
    Done(FailOutcome),
    StillLeased,
    Orphaned,
}

pub struct Reaper<S> {
    store: S,
    keys: Keys,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    config: ReaperConfig,
    cursor: Mutex<usize>,
}

impl<S: Store> Reaper<S> {
    pub fn new(
        store: S,
        keys: Keys,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            policy,
            config,
            cursor: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    fn known_queues(&self) -> QueueResult<Vec<String>> {
        let key = self.keys.queues();
        self.store.transact(|txn| {
            Ok::<_, QueueError>(txn.hgetall(&key)?.into_keys().collect())
        })
    }

    /// Run one paced scan.
    pub fn tick(&self) -> QueueResult<ReapReport> {
        let queues = self.known_queues()?;
        let mut report = ReapReport::default();
        if queues.is_empty() {
            return Ok(report);
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *cursor % queues.len();
        let mut budget = self.config.batch_size;
        let mut next = start;

        for step in 0..queues.len() {
            let idx = (start + step) % queues.len();
            if budget == 0 {
                next = idx;
                break;
            }
            let queue = &queues[idx];
            report.queues_scanned += 1;
            let reclaimed = self.reap_queue(queue, budget, &mut report)?;
            budget -= reclaimed;
            next = (idx + 1) % queues.len();
        }
        *cursor = next;
        drop(cursor);

        if report.expired_found > 0 {
            info!(
                expired = report.expired_found,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                cancelled = report.cancelled,
                skipped = report.skipped,
                "reaper tick"
            );
        }
        Ok(report)
    }

    /// Reclaim up to `budget` expired claims in `queue`; returns how many entries were consumed.
    fn reap_queue(&self, queue: &str, budget: usize, report: &mut ReapReport) -> QueueResult<usize> {
        let leases_key = self.keys.leases(queue);
        let cutoff = millis(self.clock.now()) - 1;
        let expired = self.store.transact(|txn| {
            Ok::<_, QueueError>(txn.zrange_by_score(&leases_key, ScoreRange::up_to(cutoff), 0, budget)?)
        })?;

        report.expired_found += expired.len();
        for (member, _) in &expired {
            let Ok(job_id) = member.parse::<JobId>() else {
                self.drop_index_entry(queue, member)?;
                report.skipped += 1;
                continue;
            };
            match self.reclaim(queue, job_id)? {
                Reclaim::Done(FailOutcome::Retrying { .. }) => report.retried += 1,
                Reclaim::Done(FailOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                Reclaim::Done(FailOutcome::Cancelled) => report.cancelled += 1,
                Reclaim::StillLeased | Reclaim::Orphaned => report.skipped += 1,
            }
        }
        Ok(expired.len())
    }

    fn drop_index_entry(&self, queue: &str, member: &str) -> QueueResult<()> {
        let leases_key = self.keys.leases(queue);
        self.store.transact(|txn| -> QueueResult<()> {
            txn.zrem(leases_key.as_str(), member);
            Ok(())
        })
    }

    fn reclaim(&self, queue: &str, job_id: JobId) -> QueueResult<Reclaim> {
        let id = job_id.to_string();
        let claims_key = self.keys.claims(queue);
        let jobs_key = self.keys.jobs(queue);
        let leases_key = self.keys.leases(queue);
        let cancel_key = self.keys.cancellation(queue, job_id);

        self.store.transact(|txn| -> QueueResult<Reclaim> {
            let now = self.clock.now();
            let Some(claim) = hget_json::<Claim>(txn, &claims_key, &id)? else {
                debug!(job_id = %job_id, queue = %queue, "lease index entry without claim");
                txn.zrem(leases_key.as_str(), id.as_str());
                return Ok(Reclaim::Orphaned);
            };
            if !claim.is_expired(now) {
                // renewed between scan and reclaim; make sure the index agrees
                txn.zadd(leases_key.as_str(), id.as_str(), millis(claim.lease_expires_at));
                return Ok(Reclaim::StillLeased);
            }
            let Some(job) = hget_json::<Job>(txn, &jobs_key, &id)? else {
                debug!(job_id = %job_id, queue = %queue, "claim without job record");
                clear_claim(txn, &self.keys, queue, &claim);
                return Ok(Reclaim::Orphaned);
            };

            info!(
                job_id = %job_id,
                queue = %queue,
                worker_id = %claim.worker_id,
                lease_expires_at = %claim.lease_expires_at,
                "reclaiming expired lease"
            );
            let cancelled = txn.get(&cancel_key)?.is_some();
            let failure = JobFailure::lease_expired(&claim.worker_id);
            let outcome = apply_failure(
                txn,
                &self.keys,
                &self.policy,
                job,
                &claim,
                FailureReason::LeaseExpired,
                &failure,
                cancelled,
                now,
            )?;
            Ok(Reclaim::Done(outcome))
        })
    }

    /// Run ticks on a background thread until the handle is shut down.
    ///
    /// When `fleet` is given, stale heartbeats are pruned on every tick.
    pub fn spawn(self, fleet: Option<Fleet<S>>) -> ReaperHandle
    where
        S: Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let interval = self.config.interval;

        let join = thread::Builder::new()
            .name("spindle-reaper".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "reaper started");
                loop {
                    if let Err(e) = self.tick() {
                        error!(error = %e, "reaper tick failed");
                    }
                    if let Some(fleet) = &fleet {
                        if let Err(e) = fleet.prune() {
                            error!(error = %e, "heartbeat pruning failed");
                        }
                    }
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("reaper stopped");
            });

        match join {
            Ok(join) => ReaperHandle {
                shutdown: shutdown_tx,
                join: Some(join),
            },
            Err(e) => {
                error!(error = %e, "failed to spawn reaper thread");
                ReaperHandle {
                    shutdown: shutdown_tx,
                    join: None,
                }
            }
        }
    }
}

/// Handle to a running reaper thread.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Stop after the current tick and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::codec::encode;
    use crate::store::InMemoryStore;
    use spindle_core::{Priority, WorkerId};

    /// Seed `n` claimed jobs with already-expired leases in `queue`.
    fn seed_expired(store: &Arc<InMemoryStore>, keys: &Keys, clock: &Arc<dyn Clock>, queue: &str, n: usize) {
        store
            .transact(|txn| -> QueueResult<()> {
                txn.hset(keys.queues(), queue, b"1".to_vec());
                for _ in 0..n {
                    let now = clock.now();
                    let job = Job::new(queue, Priority::Normal, vec![], now);
                    let claim = Claim::new(job.id, WorkerId::new("dead"), now, Duration::from_secs(1));
                    txn.hset(keys.jobs(queue), job.id.to_string(), encode(&job)?);
                    txn.hset(keys.claims(queue), job.id.to_string(), encode(&claim)?);
                    txn.zadd(keys.leases(queue), job.id.to_string(), millis(claim.lease_expires_at));
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn tick_is_paced_and_resumes_at_cursor() {
        let clock = spindle_core::ManualClock::starting_now();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryStore::with_clock(clock_arc.clone()));
        let keys = Keys::default();
        seed_expired(&store, &keys, &clock_arc, "a", 3);
        seed_expired(&store, &keys, &clock_arc, "b", 2);
        clock.advance(Duration::from_secs(5));

        let reaper = Reaper::new(
            store.clone(),
            keys.clone(),
            clock_arc,
            RetryPolicy::fixed(3, Duration::from_secs(1)),
            ReaperConfig {
                interval: Duration::from_secs(1),
                batch_size: 2,
            },
        );

        let first = reaper.tick().unwrap();
        assert_eq!(first.retried, 2);
        let second = reaper.tick().unwrap();
        assert_eq!(second.retried, 2);
        let third = reaper.tick().unwrap();
        assert_eq!(third.retried, 1);
        let idle = reaper.tick().unwrap();
        assert_eq!(idle.expired_found, 0);
    }

    #[test]
    fn orphaned_index_entries_are_cleaned() {
        let clock = spindle_core::ManualClock::starting_now();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryStore::with_clock(clock_arc.clone()));
        let keys = Keys::default();
        store
            .transact(|txn| -> QueueResult<()> {
                txn.hset(keys.queues(), "q", b"1".to_vec());
                txn.zadd(keys.leases("q"), JobId::new().to_string(), 0);
                txn.zadd(keys.leases("q"), "not-a-uuid", 0);
                Ok(())
            })
            .unwrap();

        let reaper = Reaper::new(
            store.clone(),
            keys.clone(),
            clock_arc,
            RetryPolicy::default(),
            ReaperConfig::default(),
        );
        let report = reaper.tick().unwrap();
        assert_eq!(report.skipped, 2);

        let left = store
            .transact(|txn| Ok::<_, QueueError>(txn.zcard(&keys.leases("q"))?))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn spawned_reaper_shuts_down() {
        let store = InMemoryStore::arc();
        let reaper = Reaper::new(
            store,
            Keys::default(),
            Arc::new(spindle_core::SystemClock),
            RetryPolicy::default(),
            ReaperConfig {
                interval: Duration::from_millis(10),
                batch_size: 10,
            },
        );
        let handle = reaper.spawn(None);
        std::thread::sleep(Duration::from_millis(30));
        assert!(handle.is_running());
        handle.shutdown();
    }
}
