//! Job bookkeeping and worker allocation.
//!
//! - [`Job`] / [`JobSink`]: a unit of work and the capability used to send
//!   its result back to whoever submitted it
//! - [`PendingQueue`]: FIFO of jobs waiting for a worker
//! - [`JobDispatcher`]: the worker pool plus the queue, guarded together

pub mod dispatcher;
pub mod job;
pub mod queue;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use dispatcher::{JobDispatcher, SubmitOutcome};
pub use job::{Job, JobId, JobSink};
pub use queue::PendingQueue;

/// The single lock every connection task goes through to touch the worker
/// pool or the pending queue.
pub type SharedDispatcher = Arc<Mutex<JobDispatcher>>;
