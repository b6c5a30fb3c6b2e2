use thiserror::Error;

use crate::worker::WorkerId;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker {0} has no job in flight")]
    WorkerIdle(WorkerId),

    #[error("Pending queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
