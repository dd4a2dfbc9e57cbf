//! Worker pool, per-job execution and crash recovery.
//!
//! A worker binds to exactly one queue and holds at most one in-flight
//! job. The pool boots by scanning for training runs that died while the
//! node was down and pushing host inventory, then starts draining queues.
//! Shutdown is warm: a broadcast signal stops dequeueing, in-flight jobs
//! run to completion.

mod executor;
mod pool;
mod recovery;

pub use executor::{JobExecutor, JobOutcome, WorkerContext};
pub use pool::WorkerPool;
pub use recovery::recover_interrupted_training;
