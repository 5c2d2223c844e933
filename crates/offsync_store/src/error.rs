//! Error types for storage operations.

use offsync_protocol::OperationId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// A storage error is fatal for the call that triggered it and must be
/// propagated to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The journal is corrupted beyond the recoverable tail.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The store refuses writes (quota exceeded, read-only medium, ...).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Another process holds the store.
    #[error("storage is locked by another process: {0}")]
    Locked(PathBuf),

    /// An update targeted an operation that does not exist.
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),
}
