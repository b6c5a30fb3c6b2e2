//! Worker-facing side of the proxy.
//!
//! - [`WorkerConnection`]: the IDLE/BUSY state the dispatcher keeps per worker
//! - [`WorkerSession`]: the per-socket task state (read buffer, framing) that
//!   turns incoming bytes into completions
//! - [`WorkerRunner`]: a minimal worker process used by the CLI and tests

pub mod connection;
pub mod runner;
pub mod session;

pub use connection::{WorkerConnection, WorkerId, WorkerStatus, WorkerSummary};
pub use runner::{EchoHandler, JobHandler, WorkerRunner};
pub use session::{run_worker_connection, WorkerSession};
