//! Worker fleet control: heartbeats and drain signals.

use std::sync::Arc;

use tracing::{debug, info};

use spindle_core::{Clock, JobId, WorkerHeartbeat, WorkerId};

use crate::codec::{decode, encode};
use crate::config::FleetConfig;
use crate::error::{QueueError, QueueResult};
use crate::keys::Keys;
use crate::store::Store;

pub struct Fleet<S> {
    store: S,
    keys: Keys,
    clock: Arc<dyn Clock>,
    config: FleetConfig,
}

impl<S: Store> Fleet<S> {
    pub fn new(store: S, keys: Keys, clock: Arc<dyn Clock>, config: FleetConfig) -> Self {
        Self {
            store,
            keys,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Upsert this worker's liveness record.
    pub fn heartbeat(&self, worker_id: &WorkerId, current_job_id: Option<JobId>) -> QueueResult<WorkerHeartbeat> {
        let beat = WorkerHeartbeat::new(worker_id.clone(), self.clock.now(), current_job_id);
        let encoded = encode(&beat)?;
        let key = self.keys.heartbeats();
        self.store.transact(|txn| -> QueueResult<()> {
            txn.hset(key.as_str(), worker_id.as_str(), encoded.clone());
            Ok(())
        })?;
        debug!(worker_id = %worker_id, current_job_id = ?current_job_id, "heartbeat");
        Ok(beat)
    }

    /// Live heartbeats, sorted by worker id. Stale entries are removed on the way.
    pub fn list(&self) -> QueueResult<Vec<WorkerHeartbeat>> {
        let (live, pruned) = self.sweep()?;
        if pruned > 0 {
            info!(pruned, "pruned stale worker heartbeats");
        }
        Ok(live)
    }

    /// Remove heartbeats (and drain flags) older than the TTL.
    pub fn prune(&self) -> QueueResult<usize> {
        let (_, pruned) = self.sweep()?;
        if pruned > 0 {
            info!(pruned, "pruned stale worker heartbeats");
        }
        Ok(pruned)
    }

    fn sweep(&self) -> QueueResult<(Vec<WorkerHeartbeat>, usize)> {
        let hb_key = self.keys.heartbeats();
        let drain_key = self.keys.drains();
        let ttl = self.config.heartbeat_ttl;

        self.store.transact(|txn| -> QueueResult<(Vec<WorkerHeartbeat>, usize)> {
            let now = self.clock.now();
            let mut live = Vec::new();
            let mut pruned = 0;
            for (worker, raw) in txn.hgetall(&hb_key)? {
                // unreadable records are treated like stale ones
                let beat = decode::<WorkerHeartbeat>(&raw).ok();
                match beat {
                    Some(beat) if !beat.is_stale(now, ttl) => live.push(beat),
                    _ => {
                        txn.hdel(hb_key.as_str(), worker.as_str());
                        txn.hdel(drain_key.as_str(), worker);
                        pruned += 1;
                    }
                }
            }
            live.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
            Ok((live, pruned))
        })
    }

    /// Graceful exit: forget the worker's heartbeat and drain flag.
    pub fn remove(&self, worker_id: &WorkerId) -> QueueResult<()> {
        let hb_key = self.keys.heartbeats();
        let drain_key = self.keys.drains();
        self.store.transact(|txn| -> QueueResult<()> {
            txn.hdel(hb_key.as_str(), worker_id.as_str());
            txn.hdel(drain_key.as_str(), worker_id.as_str());
            Ok(())
        })?;
        info!(worker_id = %worker_id, "worker deregistered");
        Ok(())
    }

    /// Ask a worker to stop taking new jobs, finish its current one and exit.
    pub fn signal_drain(&self, worker_id: &WorkerId) -> QueueResult<()> {
        let drain_key = self.keys.drains();
        let at = encode(&self.clock.now())?;
        self.store.transact(|txn| -> QueueResult<()> {
            txn.hset(drain_key.as_str(), worker_id.as_str(), at.clone());
            Ok(())
        })?;
        info!(worker_id = %worker_id, "drain signalled");
        Ok(())
    }

    pub fn is_draining(&self, worker_id: &WorkerId) -> QueueResult<bool> {
        let drain_key = self.keys.drains();
        self.store.transact(|txn| {
            Ok::<_, QueueError>(txn.hget(&drain_key, worker_id.as_str())?.is_some())
        })
    }
}
