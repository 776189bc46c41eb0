//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Enqueue timed out waiting for queue capacity. Callers may retry
    /// with backoff.
    #[error("queue full")]
    QueueFull,

    /// The queue no longer accepts jobs. Callers must stop.
    #[error("queue closed")]
    QueueClosed,

    #[error("not found: {0}")]
    NotFound(String),

    /// The executor failed before producing output streams. Step failures
    /// (nonzero exit) are not errors; they surface through step status.
    #[error("executor infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("service already started")]
    AlreadyStarted,

    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
