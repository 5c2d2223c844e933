//! Local store trait definition.

use crate::batch::StoreBatch;
use crate::error::StorageResult;
use chrono::{DateTime, Utc};
use offsync_protocol::{
    Conflict, ConflictId, EntityKey, EntitySnapshot, OperationId, OperationPatch,
    OperationStatus, ResolutionRecord, SyncOperation,
};
use serde_json::Value;

/// Selects conflicts in [`LocalStore::list_conflicts`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictFilter {
    /// Only resolved (`Some(true)`) or open (`Some(false)`) conflicts.
    pub resolved: Option<bool>,
    /// Only conflicts on this entity.
    pub key: Option<EntityKey>,
}

impl ConflictFilter {
    /// Matches every conflict.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches open conflicts.
    pub fn open() -> Self {
        Self {
            resolved: Some(false),
            key: None,
        }
    }

    /// Matches resolved conflicts.
    pub fn resolved() -> Self {
        Self {
            resolved: Some(true),
            key: None,
        }
    }

    /// Restricts the filter to one entity.
    #[must_use]
    pub fn for_key(mut self, key: EntityKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Returns true if `conflict` passes the filter.
    pub fn matches(&self, conflict: &Conflict) -> bool {
        if let Some(resolved) = self.resolved {
            if conflict.resolved != resolved {
                return false;
            }
        }
        match &self.key {
            Some(key) => conflict.entity_kind == key.kind && conflict.entity_id == key.id,
            None => true,
        }
    }
}

fn last_sync_key(kind: &str) -> String {
    format!("last_sync_time:{kind}")
}

/// Durable, transactional storage for snapshots, the operation log,
/// sync metadata and conflicts.
///
/// The store is the only shared mutable resource of the engine. Every method
/// is atomic on its own and [`LocalStore::apply_batch`] groups several writes
/// into one all-or-nothing unit.
///
/// # Invariants
///
/// - At most one snapshot exists per `(kind, id)`
/// - Snapshots are replaced whole, never patched
/// - A failed write leaves the store unchanged
/// - Operations are listed in `(created_at, sequence)` order
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait LocalStore: Send + Sync {
    /// Applies every write of `batch` or none of them.
    ///
    /// Returns the sequences assigned to appended operations, in append
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An update targets an unknown operation
    /// - The journal write fails
    /// - The store refuses writes
    fn apply_batch(&self, batch: StoreBatch) -> StorageResult<Vec<u64>>;

    /// Returns the snapshot of `(kind, id)`, if any.
    fn get(&self, kind: &str, id: &str) -> StorageResult<Option<EntitySnapshot>>;

    /// Returns every snapshot of `kind`, ordered by id.
    fn get_all(&self, kind: &str) -> StorageResult<Vec<EntitySnapshot>>;

    /// Lists operations with the given status, or all of them for `None`.
    fn list_operations(&self, status: Option<OperationStatus>)
        -> StorageResult<Vec<SyncOperation>>;

    /// Returns one operation.
    fn get_operation(&self, id: OperationId) -> StorageResult<Option<SyncOperation>>;

    /// Returns a metadata value.
    fn get_meta(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Returns one conflict.
    fn get_conflict(&self, id: ConflictId) -> StorageResult<Option<Conflict>>;

    /// Lists conflicts matching `filter`, oldest detection first.
    fn list_conflicts(&self, filter: &ConflictFilter) -> StorageResult<Vec<Conflict>>;

    /// Lists the resolution history, optionally for one kind, in append order.
    fn list_resolutions(&self, kind: Option<&str>) -> StorageResult<Vec<ResolutionRecord>>;

    /// Inserts or replaces a snapshot.
    fn put(&self, snapshot: EntitySnapshot) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().put(snapshot)).map(|_| ())
    }

    /// Removes a snapshot. Removing a missing snapshot is not an error.
    fn delete(&self, kind: &str, id: &str) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().delete(EntityKey::new(kind, id)))
            .map(|_| ())
    }

    /// Appends an operation and returns its sequence.
    fn append_operation(&self, operation: SyncOperation) -> StorageResult<u64> {
        let sequences = self.apply_batch(StoreBatch::new().append_operation(operation))?;
        Ok(sequences.first().copied().unwrap_or_default())
    }

    /// Applies a partial update to an operation.
    fn update_operation(&self, id: OperationId, patch: OperationPatch) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().update_operation(id, patch))
            .map(|_| ())
    }

    /// Removes an operation. Removing a missing operation is not an error.
    fn delete_operation(&self, id: OperationId) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().delete_operation(id))
            .map(|_| ())
    }

    /// Sets a metadata value.
    fn set_meta(&self, key: &str, value: Value) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().set_meta(key, value))
            .map(|_| ())
    }

    /// Returns the server timestamp of the last successful sync of `kind`.
    fn get_last_sync_time(&self, kind: &str) -> StorageResult<Option<DateTime<Utc>>> {
        match self.get_meta(&last_sync_key(kind))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Records the server timestamp of a successful sync of `kind`.
    fn set_last_sync_time(&self, kind: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.set_meta(&last_sync_key(kind), serde_json::to_value(at)?)
    }

    /// Inserts or replaces a conflict.
    fn put_conflict(&self, conflict: Conflict) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().put_conflict(conflict))
            .map(|_| ())
    }

    /// Removes a conflict.
    fn delete_conflict(&self, id: ConflictId) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().delete_conflict(id))
            .map(|_| ())
    }

    /// Appends to the resolution history.
    fn append_resolution(&self, record: ResolutionRecord) -> StorageResult<()> {
        self.apply_batch(StoreBatch::new().append_resolution(record))
            .map(|_| ())
    }
}
