//! Error types and error support code.

use std::time::Duration;

use thiserror::Error;

/// Error type used by the connection pool.
///
/// Generic over the error type of the underlying physical connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error<E> {
    /// No connection became available before the acquisition deadline.
    #[error("connection acquisition timeout after {0:?}")]
    AcquireTimeout(Duration),
    /// No live connection could be assigned without waiting.
    #[error("pool is exhausted")]
    PoolExhausted,
    /// Connector was unable to open a new physical connection.
    #[error("unable to open connection: {0}")]
    Connect(#[source] E),
    /// Physical connection returned an error.
    #[error("connection error: {0}")]
    Connection(#[source] E),
    /// Connection handle was used after being returned to the pool, or after being reclaimed
    /// by the pool.
    #[error("connection used after release")]
    UseAfterRelease,
    /// Pool was shut down.
    #[error("pool is closed")]
    PoolClosed,
}

impl<E> Error<E> {
    /// Whether this error signals a misuse of a connection handle, as opposed to a failure of
    /// the physical connection.
    #[must_use]
    pub fn is_use_after_release(&self) -> bool {
        matches!(self, Self::UseAfterRelease)
    }

    /// Whether this error is an acquisition timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AcquireTimeout(_))
    }
}

/// Error type used while loading and validating pool configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Minimum pool size must be at least one.
    #[error("minimum pool size must be at least 1, got {0}")]
    MinSize(usize),
    /// Maximum pool size can't be lower than minimum pool size.
    #[error("maximum pool size {max} is lower than minimum pool size {min}")]
    MaxSize {
        /// Requested maximum size.
        max: usize,
        /// Current minimum size.
        min: usize,
    },
    /// Maintenance sweep interval must be non-zero.
    #[error("sweep interval must be non-zero")]
    ZeroSweepInterval,
    /// Configuration source error.
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}
