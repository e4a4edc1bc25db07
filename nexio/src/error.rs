use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// Error type returned by the public worker, server and client APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// An underlying socket or poller call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A bounded hand-off queue had no room left for the submission.
    #[error("hand-off queue `{0}` is full")]
    QueueFull(&'static str),

    /// The connection pool reached its hard capacity.
    #[error("connection pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// The worker thread has already shut down.
    #[error("worker `{0}` is not running")]
    WorkerStopped(String),

    /// A builder received an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A textual address could not be parsed.
    #[error("invalid socket address: {0}")]
    AddrParse(#[from] AddrParseError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error a [`Protocol`](crate::Protocol) returns for unexpected failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
