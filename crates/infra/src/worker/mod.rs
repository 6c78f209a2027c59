//! Worker runtime.
//!
//! ## Components
//!
//! - `JobExecutor`: handler registry plus the dequeue loop on background threads
//! - `JobContext`: what a handler sees (payload, lease renewal, cancellation checkpoint)
//! - `JobExecutorHandle`: stats, drain-aware exit and graceful shutdown

pub mod executor;
pub mod types;

pub use executor::{ExecutionOutcome, JobExecutor, JobExecutorHandle};
pub use types::{ExecutorConfig, ExecutorStats, JobContext, JobHandler, JobResult};
