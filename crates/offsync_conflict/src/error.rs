//! Error types for conflict resolution.

use offsync_protocol::ConflictId;
use offsync_store::StorageError;
use thiserror::Error;

/// Result type for conflict operations.
pub type ConflictResult<T> = Result<T, ConflictError>;

/// Errors that can occur while resolving conflicts.
///
/// An unresolved conflict is not an error; it is an open [`offsync_protocol::Conflict`].
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// No conflict with this id exists.
    #[error("conflict not found: {0}")]
    NotFound(ConflictId),

    /// The conflict is already closed; resolutions are final.
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(ConflictId),

    /// The resolution is malformed.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),
}
