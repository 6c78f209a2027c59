//! `spindle-infra`: the store-backed side of the job queue.
//!
//! Everything that touches the backing store lives here: the store adapter
//! and its engines, the rate limiter, the priority scheduler, the claim
//! ledger, retry and dead-letter transitions, the reaper, fleet control and
//! the worker runtime. [`JobQueue`] is the surface producers and operators
//! call; [`worker::JobExecutor`] runs handlers on top of it.

pub mod breaker;
pub mod codec;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod fleet;
pub mod keys;
pub mod ledger;
pub mod queue;
pub mod rate_limiter;
pub mod reaper;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

mod integration_tests;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::QueueConfig;
pub use dead_letter::{PurgeTarget, RequeueReport};
pub use error::{QueueError, QueueResult};
pub use ledger::{AckOutcome, CancelOutcome};
pub use queue::{EnqueueOptions, JobQueue, QueueStats};
pub use rate_limiter::{Admission, BucketSnapshot, FailMode, RateLimitConfig};
pub use reaper::{ReapReport, Reaper, ReaperHandle};
pub use retry::FailOutcome;
pub use scheduler::EnqueueReceipt;
pub use store::{InMemoryStore, Store, StoreError};
