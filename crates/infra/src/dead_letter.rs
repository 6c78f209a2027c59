//! Operator tooling for the dead-letter queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use spindle_core::{Clock, DeadLetterEntry, JobId};

use crate::codec::hget_json;
use crate::error::{QueueError, QueueResult};
use crate::keys::Keys;
use crate::retry::{make_ready, next_sequence};
use crate::store::{ScoreRange, Store};

/// What to purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    All,
    Ids(Vec<JobId>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequeueReport {
    pub requeued: Vec<JobId>,
    /// Ids that were not in the dead-letter queue.
    pub missing: Vec<JobId>,
}

pub struct DeadLetters<S> {
    store: S,
    keys: Keys,
    clock: Arc<dyn Clock>,
}

impl<S: Store> DeadLetters<S> {
    pub fn new(store: S, keys: Keys, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    /// Entries ordered by failure time, oldest first.
    pub fn peek(&self, queue: &str, offset: usize, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        let index_key = self.keys.dead_letter_index(queue);
        let dlq_key = self.keys.dead_letters(queue);

        self.store.transact(|txn| {
            let ids = txn.zrange_by_score(&index_key, ScoreRange::all(), offset, limit)?;
            let mut entries = Vec::with_capacity(ids.len());
            for (id, _) in ids {
                if let Some(entry) = hget_json::<DeadLetterEntry>(txn, &dlq_key, &id)? {
                    entries.push(entry);
                }
            }
            Ok::<_, QueueError>(entries)
        })
    }

    pub fn count(&self, queue: &str) -> QueueResult<u64> {
        let dlq_key = self.keys.dead_letters(queue);
        self.store
            .transact(|txn| Ok::<_, QueueError>(txn.hlen(&dlq_key)?))
    }

    /// Move entries back to their ready set at their original priority.
    ///
    /// Attempts reset to zero; the attempt history is kept. Each id is moved
    /// in its own transaction.
    pub fn requeue(&self, queue: &str, ids: &[JobId]) -> QueueResult<RequeueReport> {
        let index_key = self.keys.dead_letter_index(queue);
        let dlq_key = self.keys.dead_letters(queue);
        let mut report = RequeueReport::default();

        for &job_id in ids {
            let id = job_id.to_string();
            let moved = self.store.transact(|txn| -> QueueResult<bool> {
                let Some(entry) = hget_json::<DeadLetterEntry>(txn, &dlq_key, &id)? else {
                    return Ok(false);
                };
                let mut job = entry.job;
                job.reset_for_requeue(self.clock.now());
                job.sequence = next_sequence(txn, &self.keys, queue)?;
                make_ready(txn, &self.keys, &job)?;
                txn.hdel(dlq_key.as_str(), id.as_str());
                txn.zrem(index_key.as_str(), id.as_str());
                Ok(true)
            })?;

            if moved {
                info!(job_id = %job_id, queue = %queue, "dead-lettered job requeued");
                report.requeued.push(job_id);
            } else {
                warn!(job_id = %job_id, queue = %queue, "requeue skipped; not in dead-letter queue");
                report.missing.push(job_id);
            }
        }
        Ok(report)
    }

    /// Delete entries permanently. Returns how many were removed.
    pub fn purge(&self, queue: &str, target: &PurgeTarget) -> QueueResult<u64> {
        let index_key = self.keys.dead_letter_index(queue);
        let dlq_key = self.keys.dead_letters(queue);

        let removed = self.store.transact(|txn| -> QueueResult<u64> {
            match target {
                PurgeTarget::All => {
                    let count = txn.hlen(&dlq_key)?;
                    txn.del(dlq_key.as_str());
                    txn.del(index_key.as_str());
                    Ok(count)
                }
                PurgeTarget::Ids(ids) => {
                    let unique: BTreeSet<&JobId> = ids.iter().collect();
                    let mut count = 0;
                    for job_id in unique {
                        let id = job_id.to_string();
                        if txn.hget(&dlq_key, &id)?.is_some() {
                            txn.hdel(dlq_key.as_str(), id.as_str());
                            txn.zrem(index_key.as_str(), id);
                            count += 1;
                        }
                    }
                    Ok(count)
                }
            }
        })?;

        info!(queue = %queue, removed, all = matches!(target, PurgeTarget::All), "dead-letter queue purged");
        Ok(removed)
    }
}
