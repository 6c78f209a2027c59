//! `spindle-core`: domain primitives of the job queue.
//!
//! This crate contains **pure** logic (no store access, no IO): records, the
//! retry state machine, token-bucket arithmetic and the priority selection
//! rule. The infra crate persists these and enforces atomicity.

pub mod bucket;
pub mod claim;
pub mod clock;
pub mod dead_letter;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod selection;

pub use bucket::TokenBucket;
pub use claim::{Claim, WorkerHeartbeat};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::{DeadLetterCause, DeadLetterEntry};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{AttemptRecord, FailureReason, Job, JobFailure, Priority};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use selection::{StarvationGuard, StreakState};
