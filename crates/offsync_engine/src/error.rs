//! Error types for the sync engine.

use offsync_conflict::ConflictError;
use offsync_store::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Transport-class failures abort only the current pass or connection
/// attempt and are retried by the normal scheduling paths. Storage failures
/// abort the triggering call and are always propagated.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Conflict bookkeeping failed.
    #[error("conflict error: {0}")]
    Conflict(#[from] ConflictError),

    /// The caller asked for something the engine cannot do.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine is shutting down.
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if the failure came from the network side.
    ///
    /// These end a sync pass without touching local state; everything else
    /// is a local failure that must reach the caller.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. }
                | SyncError::Protocol(_)
                | SyncError::ServerError(_)
                | SyncError::Timeout
                | SyncError::NotConnected
        )
    }
}
