//! Ownership and liveness records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::saturating_add;
use crate::id::{JobId, WorkerId};

/// Time-bounded ownership of an in-flight job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    /// Lease length granted at claim time; each renewal extends by this much.
    pub lease: Duration,
}

impl Claim {
    pub fn new(job_id: JobId, worker_id: WorkerId, now: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            job_id,
            worker_id,
            claimed_at: now,
            lease_expires_at: saturating_add(now, lease),
            lease,
        }
    }

    pub fn is_owned_by(&self, worker_id: &WorkerId) -> bool {
        &self.worker_id == worker_id
    }

    /// A lease is expired once `lease_expires_at` is strictly in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at < now
    }

    /// Extend the lease from `now` by the originally granted length.
    pub fn renewed(&self, now: DateTime<Utc>) -> Self {
        Self {
            lease_expires_at: saturating_add(now, self.lease),
            ..self.clone()
        }
    }
}

/// Liveness record upserted by a worker on a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub last_seen_at: DateTime<Utc>,
    pub current_job_id: Option<JobId>,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: WorkerId, now: DateTime<Utc>, current_job_id: Option<JobId>) -> Self {
        Self {
            worker_id,
            last_seen_at: now,
            current_job_id,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        saturating_add(self.last_seen_at, ttl) < now
    }
}
