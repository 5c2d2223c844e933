//! Atomic multi-entity write batches.

use offsync_protocol::{
    Conflict, ConflictId, EntityKey, EntitySnapshot, OperationId, OperationPatch,
    ResolutionRecord, SyncOperation,
};
use serde_json::Value;

/// One write inside a [`StoreBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Insert or overwrite a snapshot.
    Put(EntitySnapshot),
    /// Remove a snapshot.
    Delete(EntityKey),
    /// Append an operation to the log; the store assigns its sequence.
    AppendOperation(SyncOperation),
    /// Patch a stored operation.
    UpdateOperation(OperationId, OperationPatch),
    /// Remove an operation from the log. Missing ids are ignored.
    DeleteOperation(OperationId),
    /// Set a metadata value.
    SetMeta(String, Value),
    /// Insert or overwrite a conflict.
    PutConflict(Conflict),
    /// Remove a conflict.
    DeleteConflict(ConflictId),
    /// Append to the resolution history.
    AppendResolution(ResolutionRecord),
}

/// A set of writes that is applied all-or-nothing.
///
/// # Example
///
/// ```rust
/// use offsync_store::{LocalStore, MemoryStore, StoreBatch};
/// use offsync_protocol::{EntityKey, EntitySnapshot};
/// use chrono::Utc;
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// let batch = StoreBatch::new()
///     .put(EntitySnapshot::new("Product", "1", json!({"stockQuantity": 3}), Utc::now()))
///     .delete(EntityKey::new("Product", "2"));
/// store.apply_batch(batch).unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreBatch {
    ops: Vec<BatchOp>,
}

impl StoreBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a snapshot write.
    #[must_use]
    pub fn put(mut self, snapshot: EntitySnapshot) -> Self {
        self.ops.push(BatchOp::Put(snapshot));
        self
    }

    /// Adds a snapshot removal.
    #[must_use]
    pub fn delete(mut self, key: EntityKey) -> Self {
        self.ops.push(BatchOp::Delete(key));
        self
    }

    /// Adds an operation append.
    #[must_use]
    pub fn append_operation(mut self, operation: SyncOperation) -> Self {
        self.ops.push(BatchOp::AppendOperation(operation));
        self
    }

    /// Adds an operation patch.
    #[must_use]
    pub fn update_operation(mut self, id: OperationId, patch: OperationPatch) -> Self {
        self.ops.push(BatchOp::UpdateOperation(id, patch));
        self
    }

    /// Adds an operation removal.
    #[must_use]
    pub fn delete_operation(mut self, id: OperationId) -> Self {
        self.ops.push(BatchOp::DeleteOperation(id));
        self
    }

    /// Adds a metadata write.
    #[must_use]
    pub fn set_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.ops.push(BatchOp::SetMeta(key.into(), value));
        self
    }

    /// Adds a conflict write.
    #[must_use]
    pub fn put_conflict(mut self, conflict: Conflict) -> Self {
        self.ops.push(BatchOp::PutConflict(conflict));
        self
    }

    /// Adds a conflict removal.
    #[must_use]
    pub fn delete_conflict(mut self, id: ConflictId) -> Self {
        self.ops.push(BatchOp::DeleteConflict(id));
        self
    }

    /// Adds a resolution history entry.
    #[must_use]
    pub fn append_resolution(mut self, record: ResolutionRecord) -> Self {
        self.ops.push(BatchOp::AppendResolution(record));
        self
    }

    /// Adds an arbitrary op.
    pub fn push(&mut self, op: BatchOp) {
        self.ops.push(op);
    }

    /// Appends every op of `other`.
    pub fn extend(&mut self, other: StoreBatch) {
        self.ops.extend(other.ops);
    }

    /// Returns the ops in order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consumes the batch.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Returns the number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch holds no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
