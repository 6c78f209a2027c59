//! Error model for queue operations.

use std::time::Duration;

use spindle_core::{DomainError, JobId, WorkerId};

use crate::store::StoreError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Admission denied; not a failure.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The caller does not hold the claim it tried to act on.
    #[error("job {job_id} is not claimed by worker {worker_id}")]
    ClaimConflict { job_id: JobId, worker_id: WorkerId },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The circuit breaker is open; the store was not contacted.
    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("transaction gave up under contention: {0}")]
    Contention(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),
}

impl QueueError {
    /// Failures that should trip the circuit breaker.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }

    /// Conditions a caller may retry later without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::RateLimited { .. }
                | QueueError::StoreUnavailable(_)
                | QueueError::CircuitOpen
                | QueueError::Contention(_)
        )
    }
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => QueueError::StoreUnavailable(msg),
            StoreError::Contention { attempts } => {
                QueueError::Contention(format!("aborted after {attempts} attempts"))
            }
            StoreError::Protocol(msg) => QueueError::Store(msg),
        }
    }
}

impl From<DomainError> for QueueError {
    fn from(e: DomainError) -> Self {
        QueueError::InvalidRequest(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailability_trips_the_breaker() {
        assert!(QueueError::from(StoreError::Unavailable("down".into())).is_store_failure());
        assert!(!QueueError::from(StoreError::Protocol("WRONGTYPE".into())).is_store_failure());
        assert!(!QueueError::CircuitOpen.is_store_failure());
    }

    #[test]
    fn rate_limit_is_transient() {
        let e = QueueError::RateLimited {
            retry_after: Duration::from_millis(250),
        };
        assert!(e.is_transient());
        assert!(!QueueError::Codec("bad".into()).is_transient());
    }
}
