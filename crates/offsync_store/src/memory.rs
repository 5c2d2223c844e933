//! In-memory store for testing.

use crate::backend::{ConflictFilter, LocalStore};
use crate::batch::StoreBatch;
use crate::error::{StorageError, StorageResult};
use crate::state::StoreState;
use offsync_protocol::{
    Conflict, ConflictId, EntitySnapshot, OperationId, OperationStatus, ResolutionRecord,
    SyncOperation,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory store.
///
/// This store keeps everything in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral engines that don't need persistence
///
/// Writes can be switched off with [`MemoryStore::fail_writes`] to
/// exercise the paths taken when the device runs out of space.
///
/// # Example
///
/// ```rust
/// use offsync_store::{LocalStore, MemoryStore, StorageError};
/// use offsync_protocol::NewOperation;
/// use chrono::Utc;
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.fail_writes(true);
/// let op = NewOperation::create("Customer", "1", json!({})).into_operation(Utc::now());
/// assert!(matches!(store.append_operation(op), Err(StorageError::Unavailable(_))));
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail with [`StorageError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn apply_batch(&self, batch: StoreBatch) -> StorageResult<Vec<u64>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage quota exceeded".into()));
        }
        let mut state = self.state.write();
        let (ops, sequences) = state.prepare(batch)?;
        state.commit(ops);
        Ok(sequences)
    }

    fn get(&self, kind: &str, id: &str) -> StorageResult<Option<EntitySnapshot>> {
        Ok(self.state.read().get(kind, id))
    }

    fn get_all(&self, kind: &str) -> StorageResult<Vec<EntitySnapshot>> {
        Ok(self.state.read().get_all(kind))
    }

    fn list_operations(
        &self,
        status: Option<OperationStatus>,
    ) -> StorageResult<Vec<SyncOperation>> {
        Ok(self.state.read().list_operations(status))
    }

    fn get_operation(&self, id: OperationId) -> StorageResult<Option<SyncOperation>> {
        Ok(self.state.read().get_operation(id))
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.state.read().get_meta(key))
    }

    fn get_conflict(&self, id: ConflictId) -> StorageResult<Option<Conflict>> {
        Ok(self.state.read().get_conflict(id))
    }

    fn list_conflicts(&self, filter: &ConflictFilter) -> StorageResult<Vec<Conflict>> {
        Ok(self.state.read().list_conflicts(filter))
    }

    fn list_resolutions(&self, kind: Option<&str>) -> StorageResult<Vec<ResolutionRecord>> {
        Ok(self.state.read().list_resolutions(kind))
    }
}
