//! Failure transitions shared by `Fail` and the reaper.
//!
//! Runs inside the caller's transaction after the claim has been verified:
//! clears the claim, counts the attempt, and writes the job either back to
//! its ready set (delayed) or into the dead-letter queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use spindle_core::clock::millis;
use spindle_core::{
    Claim, DeadLetterCause, DeadLetterEntry, FailureReason, Job, JobFailure, RetryDecision,
    RetryPolicy,
};

use crate::codec::encode;
use crate::error::QueueResult;
use crate::keys::Keys;
use crate::store::Txn;

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    Retrying {
        attempt: u32,
        not_before: DateTime<Utc>,
    },
    DeadLettered {
        attempt: u32,
        cause: DeadLetterCause,
    },
    /// A cancellation marker was set; the job was discarded instead of retried.
    Cancelled,
}

/// Remove the claim and its lease index entry.
pub(crate) fn clear_claim(txn: &mut Txn<'_>, keys: &Keys, queue: &str, claim: &Claim) {
    let job_id = claim.job_id.to_string();
    txn.hdel(keys.claims(queue), job_id.as_str());
    txn.zrem(keys.leases(queue), job_id);
}

/// Drop every trace of a job that will not run again.
pub(crate) fn discard_job(txn: &mut Txn<'_>, keys: &Keys, job: &Job) {
    txn.hdel(keys.jobs(&job.queue), job.id.to_string());
    txn.zrem(
        keys.ready(&job.queue, job.priority),
        Keys::ready_member(job.sequence, job.id),
    );
    txn.del(keys.cancellation(&job.queue, job.id));
}

/// Put a job (back) into its ready set at its original priority.
pub(crate) fn make_ready(txn: &mut Txn<'_>, keys: &Keys, job: &Job) -> QueueResult<()> {
    txn.hset(keys.jobs(&job.queue), job.id.to_string(), encode(job)?);
    txn.zadd(
        keys.ready(&job.queue, job.priority),
        Keys::ready_member(job.sequence, job.id),
        millis(job.eligible_at()),
    );
    Ok(())
}

/// Next enqueue sequence for `queue`, written back in the same transaction.
pub(crate) fn next_sequence(txn: &mut Txn<'_>, keys: &Keys, queue: &str) -> QueueResult<u64> {
    let key = keys.sequence(queue);
    let current = match txn.get(&key)? {
        Some(raw) => String::from_utf8_lossy(&raw).trim().parse::<u64>().unwrap_or(0),
        None => 0,
    };
    let next = current + 1;
    txn.set(key, next.to_string().into_bytes(), None);
    Ok(next)
}

/// Apply the retry state machine to a failed attempt.
#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_failure(
    txn: &mut Txn<'_>,
    keys: &Keys,
    policy: &RetryPolicy,
    mut job: Job,
    claim: &Claim,
    reason: FailureReason,
    failure: &JobFailure,
    cancelled: bool,
    now: DateTime<Utc>,
) -> QueueResult<FailOutcome> {
    clear_claim(txn, keys, &job.queue, claim);

    if cancelled {
        discard_job(txn, keys, &job);
        info!(
            job_id = %job.id,
            queue = %job.queue,
            worker_id = %claim.worker_id,
            "cancelled job discarded after failure"
        );
        return Ok(FailOutcome::Cancelled);
    }

    let attempt = job.record_failure(
        claim.worker_id.clone(),
        claim.claimed_at,
        now,
        reason,
        failure,
    );

    match policy.decide(attempt, job.max_attempts, &failure.class, now) {
        RetryDecision::Retry { not_before, delay } => {
            job.sequence = next_sequence(txn, keys, &job.queue)?;
            job.not_before = Some(not_before);
            make_ready(txn, keys, &job)?;
            info!(
                job_id = %job.id,
                queue = %job.queue,
                priority = %job.priority,
                worker_id = %claim.worker_id,
                attempt,
                max_attempts = job.max_attempts,
                error_class = %failure.class,
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                not_before = %not_before,
                "job scheduled for retry"
            );
            Ok(FailOutcome::Retrying {
                attempt,
                not_before,
            })
        }
        RetryDecision::DeadLetter { cause } => {
            let job_id = job.id.to_string();
            let queue = job.queue.clone();
            discard_job(txn, keys, &job);
            let entry = DeadLetterEntry::new(job, cause, reason, failure.clone(), now);
            txn.hset(keys.dead_letters(&queue), job_id.as_str(), encode(&entry)?);
            txn.zadd(keys.dead_letter_index(&queue), job_id.as_str(), millis(now));
            warn!(
                job_id = %job_id,
                queue = %queue,
                worker_id = %claim.worker_id,
                attempt,
                error_class = %failure.class,
                reason = %reason,
                cause = %cause,
                "job moved to dead-letter queue"
            );
            Ok(FailOutcome::DeadLettered { attempt, cause })
        }
    }
}
