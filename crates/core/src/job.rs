//! Job records and priority classes.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, WorkerId};

/// Ordinal priority class. Declaration order is dequeue preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// All classes, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Position in [`Priority::ALL`].
    pub fn rank(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn from_rank(rank: usize) -> Option<Self> {
        Self::ALL.get(rank).copied()
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(DomainError::validation(format!("unknown priority: {other}"))),
        }
    }
}

/// Why an attempt ended without an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The owning worker reported a failure.
    WorkerError,
    /// The claim lease expired and the reaper reclaimed the job.
    LeaseExpired,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::WorkerError => "worker_error",
            FailureReason::LeaseExpired => "lease_expired",
        }
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a worker (or synthesized by the reaper).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Error class used by retry policy (e.g. `timeout`, `payload_validation`).
    pub class: String,
    pub message: String,
}

impl JobFailure {
    pub const LEASE_EXPIRED: &'static str = "lease_expired";

    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    pub fn lease_expired(worker_id: &WorkerId) -> Self {
        Self::new(
            Self::LEASE_EXPIRED,
            format!("lease held by {worker_id} expired before ack"),
        )
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Record of a failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number after the failure was counted (1-indexed).
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub reason: FailureReason,
    pub error_class: String,
    pub message: String,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub priority: Priority,
    /// Opaque payload bytes.
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts so far (starts at 0).
    pub attempt: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be dequeued.
    pub not_before: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    /// Enqueue order within the queue; breaks ties between equally eligible jobs.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl Job {
    pub fn new(
        queue: impl Into<String>,
        priority: Priority,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            priority,
            payload,
            enqueued_at: now,
            attempt: 0,
            max_attempts: 3,
            not_before: None,
            idempotency_key: None,
            sequence: 0,
            history: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
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

    /// The instant the job becomes dequeueable.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        match self.not_before {
            Some(at) if at > self.enqueued_at => at,
            _ => self.enqueued_at,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at() <= now
    }

    /// Check the static invariants of a job record.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.queue.is_empty() {
            return Err(DomainError::validation("queue name must not be empty"));
        }
        if self.queue.contains(char::is_whitespace) || self.queue.contains(':') {
            return Err(DomainError::validation(format!(
                "queue name {:?} must not contain whitespace or ':'",
                self.queue
            )));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be >= 1"));
        }
        if self.attempt > self.max_attempts {
            return Err(DomainError::invariant(format!(
                "attempt {} exceeds max_attempts {}",
                self.attempt, self.max_attempts
            )));
        }
        Ok(())
    }

    /// Count a failed attempt and append it to the history. Returns the new
    /// attempt count.
    pub fn record_failure(
        &mut self,
        worker_id: WorkerId,
        claimed_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        reason: FailureReason,
        failure: &JobFailure,
    ) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            worker_id,
            claimed_at,
            failed_at,
            reason,
            error_class: failure.class.clone(),
            message: failure.message.clone(),
        });
        self.attempt
    }

    /// Prepare a dead-lettered job for another round: attempts reset, history kept.
    pub fn reset_for_requeue(&mut self, now: DateTime<Utc>) {
        self.attempt = 0;
        self.not_before = None;
        self.enqueued_at = now;
    }
}

mod payload_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
