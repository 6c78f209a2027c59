//! Dead-letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{AttemptRecord, FailureReason, Job, JobFailure};

/// Why a job stopped being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterCause {
    /// `attempt` reached `max_attempts`.
    Exhausted,
    /// The error class is non-retryable by policy.
    PolicyViolation,
}

impl DeadLetterCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterCause::Exhausted => "exhausted",
            DeadLetterCause::PolicyViolation => "policy_violation",
        }
    }
}

impl core::fmt::Display for DeadLetterCause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal record for a job that will not be retried automatically.
///
/// Removed only by operator action (requeue or purge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Snapshot of the job at promotion time, including its attempt history.
    pub job: Job,
    pub cause: DeadLetterCause,
    pub failure_reason: FailureReason,
    pub last_error: JobFailure,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        job: Job,
        cause: DeadLetterCause,
        failure_reason: FailureReason,
        last_error: JobFailure,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job,
            cause,
            failure_reason,
            last_error,
            failed_at,
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.job.history
    }
}
