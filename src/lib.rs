pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod worker;

pub use error::{ProxyError, Result};
