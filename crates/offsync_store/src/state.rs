//! In-memory image of the store shared by every implementation.
//!
//! Writes go through two phases. [`StoreState::prepare`] validates a batch
//! against the current state and resolves it into journal ops without
//! touching anything; [`StoreState::commit`] then applies those ops and
//! cannot fail. A persistent store writes the resolved ops to disk between
//! the two phases, so a failed write never reaches the in-memory image.

use crate::backend::ConflictFilter;
use crate::batch::{BatchOp, StoreBatch};
use crate::error::{StorageError, StorageResult};
use offsync_protocol::{
    Conflict, ConflictId, EntityKey, EntitySnapshot, OperationId, OperationStatus,
    ResolutionRecord, SyncOperation,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A fully resolved write, as persisted in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalOp {
    PutSnapshot { snapshot: EntitySnapshot },
    DeleteSnapshot { key: EntityKey },
    PutOperation { operation: SyncOperation },
    DeleteOperation { id: OperationId },
    SetMeta { key: String, value: Value },
    PutConflict { conflict: Conflict },
    DeleteConflict { id: ConflictId },
    AppendResolution { record: ResolutionRecord },
    NextSequence { sequence: u64 },
}

/// The live contents of a store.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    snapshots: BTreeMap<EntityKey, EntitySnapshot>,
    operations: HashMap<OperationId, SyncOperation>,
    next_sequence: u64,
    meta: BTreeMap<String, Value>,
    conflicts: HashMap<ConflictId, Conflict>,
    resolutions: Vec<ResolutionRecord>,
}

impl StoreState {
    pub(crate) fn new() -> Self {
        Self {
            next_sequence: 1,
            ..Self::default()
        }
    }

    /// Validates `batch` and resolves it into journal ops.
    ///
    /// Returns the ops plus the sequences assigned to appended operations.
    pub(crate) fn prepare(&self, batch: StoreBatch) -> StorageResult<(Vec<JournalOp>, Vec<u64>)> {
        // Operations touched earlier in the same batch; `None` marks a delete.
        let mut staged: HashMap<OperationId, Option<SyncOperation>> = HashMap::new();
        let mut next_sequence = self.next_sequence;
        let mut sequences = Vec::new();
        let mut ops = Vec::with_capacity(batch.len());

        for op in batch.into_ops() {
            match op {
                BatchOp::Put(snapshot) => ops.push(JournalOp::PutSnapshot { snapshot }),
                BatchOp::Delete(key) => ops.push(JournalOp::DeleteSnapshot { key }),
                BatchOp::AppendOperation(mut operation) => {
                    operation.sequence = next_sequence;
                    sequences.push(next_sequence);
                    next_sequence += 1;
                    staged.insert(operation.id, Some(operation.clone()));
                    ops.push(JournalOp::PutOperation { operation });
                }
                BatchOp::UpdateOperation(id, patch) => {
                    let current = match staged.get(&id) {
                        Some(entry) => entry.clone(),
                        None => self.operations.get(&id).cloned(),
                    };
                    let mut operation = current.ok_or(StorageError::OperationNotFound(id))?;
                    operation.apply_patch(&patch);
                    staged.insert(id, Some(operation.clone()));
                    ops.push(JournalOp::PutOperation { operation });
                }
                BatchOp::DeleteOperation(id) => {
                    let exists = match staged.get(&id) {
                        Some(entry) => entry.is_some(),
                        None => self.operations.contains_key(&id),
                    };
                    if exists {
                        staged.insert(id, None);
                        ops.push(JournalOp::DeleteOperation { id });
                    }
                }
                BatchOp::SetMeta(key, value) => ops.push(JournalOp::SetMeta { key, value }),
                BatchOp::PutConflict(conflict) => ops.push(JournalOp::PutConflict { conflict }),
                BatchOp::DeleteConflict(id) => ops.push(JournalOp::DeleteConflict { id }),
                BatchOp::AppendResolution(record) => {
                    ops.push(JournalOp::AppendResolution { record });
                }
            }
        }

        Ok((ops, sequences))
    }

    /// Applies resolved ops. Used both for live writes and for replay.
    pub(crate) fn commit(&mut self, ops: Vec<JournalOp>) {
        for op in ops {
            match op {
                JournalOp::PutSnapshot { snapshot } => {
                    self.snapshots.insert(snapshot.key(), snapshot);
                }
                JournalOp::DeleteSnapshot { key } => {
                    self.snapshots.remove(&key);
                }
                JournalOp::PutOperation { operation } => {
                    self.next_sequence = self.next_sequence.max(operation.sequence + 1);
                    self.operations.insert(operation.id, operation);
                }
                JournalOp::DeleteOperation { id } => {
                    self.operations.remove(&id);
                }
                JournalOp::SetMeta { key, value } => {
                    self.meta.insert(key, value);
                }
                JournalOp::PutConflict { conflict } => {
                    self.conflicts.insert(conflict.id, conflict);
                }
                JournalOp::DeleteConflict { id } => {
                    self.conflicts.remove(&id);
                }
                JournalOp::AppendResolution { record } => self.resolutions.push(record),
                JournalOp::NextSequence { sequence } => {
                    self.next_sequence = self.next_sequence.max(sequence);
                }
            }
        }
    }

    /// Dumps the live state as ops that rebuild it from scratch.
    pub(crate) fn to_journal(&self) -> Vec<JournalOp> {
        let mut ops = vec![JournalOp::NextSequence {
            sequence: self.next_sequence,
        }];
        ops.extend(
            self.snapshots
                .values()
                .cloned()
                .map(|snapshot| JournalOp::PutSnapshot { snapshot }),
        );
        ops.extend(
            self.list_operations(None)
                .into_iter()
                .map(|operation| JournalOp::PutOperation { operation }),
        );
        ops.extend(self.meta.iter().map(|(key, value)| JournalOp::SetMeta {
            key: key.clone(),
            value: value.clone(),
        }));
        ops.extend(
            self.list_conflicts(&ConflictFilter::all())
                .into_iter()
                .map(|conflict| JournalOp::PutConflict { conflict }),
        );
        ops.extend(
            self.resolutions
                .iter()
                .cloned()
                .map(|record| JournalOp::AppendResolution { record }),
        );
        ops
    }

    pub(crate) fn get(&self, kind: &str, id: &str) -> Option<EntitySnapshot> {
        self.snapshots.get(&EntityKey::new(kind, id)).cloned()
    }

    pub(crate) fn get_all(&self, kind: &str) -> Vec<EntitySnapshot> {
        self.snapshots
            .values()
            .filter(|snapshot| snapshot.kind == kind)
            .cloned()
            .collect()
    }

    pub(crate) fn list_operations(&self, status: Option<OperationStatus>) -> Vec<SyncOperation> {
        let mut operations: Vec<SyncOperation> = self
            .operations
            .values()
            .filter(|op| status.map_or(true, |status| op.status == status))
            .cloned()
            .collect();
        operations.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        operations
    }

    pub(crate) fn get_operation(&self, id: OperationId) -> Option<SyncOperation> {
        self.operations.get(&id).cloned()
    }

    pub(crate) fn get_meta(&self, key: &str) -> Option<Value> {
        self.meta.get(key).cloned()
    }

    pub(crate) fn get_conflict(&self, id: ConflictId) -> Option<Conflict> {
        self.conflicts.get(&id).cloned()
    }

    pub(crate) fn list_conflicts(&self, filter: &ConflictFilter) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self
            .conflicts
            .values()
            .filter(|conflict| filter.matches(conflict))
            .cloned()
            .collect();
        conflicts.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        conflicts
    }

    pub(crate) fn list_resolutions(&self, kind: Option<&str>) -> Vec<ResolutionRecord> {
        self.resolutions
            .iter()
            .filter(|record| kind.map_or(true, |kind| record.entity_kind == kind))
            .cloned()
            .collect()
    }
}
