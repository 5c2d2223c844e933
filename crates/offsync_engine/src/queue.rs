//! Offline operation queue.
//!
//! The operation log in the [`LocalStore`] is the ground truth. The queue
//! keeps a disposable in-memory index of it, rebuilt on [`OperationQueue::open`]
//! and updated only after each store write succeeds.
//!
//! Delivery order is `(priority, created_at, sequence)` with
//! `Delete < Create < Update`. Failed deliveries back off exponentially and
//! stop at `max_attempts`, after which the operation stays `Failed` until
//! [`OperationQueue::retry_failed`] is called.

use crate::config::RetryConfig;
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use offsync_protocol::{
    Clock, EntityKey, OperationId, OperationPatch, OperationStatus, OperationType, SyncOperation,
};
use offsync_store::{BatchOp, LocalStore, StoreBatch};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A queued operation together with its scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// The operation.
    pub operation: SyncOperation,
    /// Delivery priority; lower goes first.
    pub priority: u8,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last delivery error.
    pub last_error: Option<String>,
}

impl From<&SyncOperation> for QueueItem {
    fn from(operation: &SyncOperation) -> Self {
        Self {
            priority: operation.op_type.priority(),
            attempts: operation.retry_count,
            next_attempt_at: operation.next_attempt_at,
            last_error: operation.last_error.clone(),
            operation: operation.clone(),
        }
    }
}

/// Queue counters, always available offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Operations waiting for delivery.
    pub pending: usize,
    /// Operations in flight.
    pub processing: usize,
    /// Operations that exhausted their attempts.
    pub failed: usize,
    /// All queued operations.
    pub total: usize,
    /// Creation time of the oldest pending operation.
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Creation time of the newest pending operation.
    pub newest_pending: Option<DateTime<Utc>>,
}

/// What a reported delivery outcome did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeEffect {
    /// Delivered; the operation left the queue.
    Removed,
    /// Scheduled for another attempt.
    Rescheduled {
        /// When the next attempt becomes due.
        at: DateTime<Utc>,
    },
    /// Attempts are exhausted; the operation is now `Failed`.
    Exhausted,
    /// Unknown or already failed operation; nothing changed.
    Ignored,
}

/// An edit of queued operations committed together with other writes.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEdit {
    /// Drop every queued operation on the entity.
    Discard(EntityKey),
    /// Replace the payload of the latest queued operation on the entity.
    CarryPayload(EntityKey, Value),
}

/// The net change a group of operations on one entity amounts to.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveChange {
    /// The entity.
    pub key: EntityKey,
    /// What to upload; `None` when the operations cancel out.
    pub op_type: Option<OperationType>,
    /// Latest payload (`null` for deletes).
    pub payload: Value,
    /// Creation time of the latest operation.
    pub timestamp: DateTime<Utc>,
    /// Every operation folded into this change, oldest first.
    pub operation_ids: Vec<OperationId>,
}

impl EffectiveChange {
    /// Folds the operations on one entity, oldest first, into one change.
    ///
    /// `Create` then `Update` is a `Create` with the latest payload;
    /// `Create` then `Delete` cancels out; `Delete` then `Create` is an
    /// `Update` of the existing server entity. Returns `None` for an empty
    /// slice.
    pub fn fold(operations: &[SyncOperation]) -> Option<Self> {
        let first = operations.first()?;
        let last = operations.last()?;
        let op_type = match (first.op_type, last.op_type) {
            (OperationType::Create, OperationType::Delete) => None,
            (OperationType::Create, _) => Some(OperationType::Create),
            (OperationType::Delete, OperationType::Create) => Some(OperationType::Update),
            (_, last) => Some(last),
        };
        let payload = match op_type {
            Some(OperationType::Delete) | None => Value::Null,
            _ => last.payload.clone(),
        };
        Some(Self {
            key: last.key(),
            op_type,
            payload,
            timestamp: last.created_at,
            operation_ids: operations.iter().map(|op| op.id).collect(),
        })
    }

    /// Returns true if nothing needs to reach the server.
    pub fn is_cancelled(&self) -> bool {
        self.op_type.is_none()
    }
}

/// Persistent, prioritized queue of local mutations.
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    index: Mutex<HashMap<OperationId, SyncOperation>>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("retry", &self.retry)
            .field("len", &self.index.lock().len())
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Rebuilds the queue from the store's operation log.
    ///
    /// Operations left `Processing` by an interrupted pass are reset to
    /// `Pending`; `Completed` leftovers are removed.
    pub fn open(
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> SyncResult<Self> {
        let mut operations = store.list_operations(None)?;

        let mut batch = StoreBatch::new();
        let mut recovered = 0usize;
        operations.retain_mut(|op| match op.status {
            OperationStatus::Processing => {
                let patch = OperationPatch::new().status(OperationStatus::Pending);
                op.apply_patch(&patch);
                batch.push(BatchOp::UpdateOperation(op.id, patch));
                recovered += 1;
                true
            }
            OperationStatus::Completed => {
                batch.push(BatchOp::DeleteOperation(op.id));
                false
            }
            _ => true,
        });
        if !batch.is_empty() {
            store.apply_batch(batch)?;
        }
        if recovered > 0 {
            info!(recovered, "reset interrupted operations to pending");
        }

        let index = operations.into_iter().map(|op| (op.id, op)).collect();
        Ok(Self {
            store,
            clock,
            retry,
            index: Mutex::new(index),
        })
    }

    /// Returns the retry policy.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Appends an operation.
    ///
    /// The store write happens first; on failure nothing is indexed.
    pub fn enqueue(&self, operation: SyncOperation) -> SyncResult<SyncOperation> {
        self.enqueue_with(operation, StoreBatch::new())
    }

    /// Appends an operation atomically with other writes.
    pub fn enqueue_with(
        &self,
        mut operation: SyncOperation,
        batch: StoreBatch,
    ) -> SyncResult<SyncOperation> {
        let mut index = self.index.lock();
        // Appended last, so its sequence is the last one assigned.
        let sequences = self
            .store
            .apply_batch(batch.append_operation(operation.clone()))?;
        operation.sequence = sequences.last().copied().unwrap_or_default();
        debug!(
            operation_id = %operation.id,
            op_type = %operation.op_type,
            entity_kind = %operation.entity_kind,
            entity_id = %operation.entity_id,
            "operation enqueued"
        );
        index.insert(operation.id, operation.clone());
        Ok(operation)
    }

    /// Returns up to `max` operations due for delivery, in delivery order.
    pub fn next_batch(&self, max: usize) -> Vec<SyncOperation> {
        self.next_batch_excluding(max, &HashSet::new())
    }

    /// Like [`next_batch`](Self::next_batch), skipping operations on the
    /// `held` entities so they do not take up batch slots.
    pub fn next_batch_excluding(&self, max: usize, held: &HashSet<EntityKey>) -> Vec<SyncOperation> {
        let now = self.clock.now();
        let index = self.index.lock();
        let mut ready: Vec<&SyncOperation> = index
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .filter(|op| !self.retry.is_exhausted(op.retry_count))
            .filter(|op| op.next_attempt_at.map_or(true, |at| at <= now))
            .filter(|op| held.is_empty() || !held.contains(&op.key()))
            .collect();
        ready.sort_by(|a, b| delivery_order(a, b));
        ready.into_iter().take(max).cloned().collect()
    }

    /// Records the result of a delivery attempt.
    ///
    /// Success removes the operation. Failure counts an attempt and either
    /// schedules a retry after `initial_delay * 2^(attempts-1)` or marks the
    /// operation `Failed`. Unknown and failed operations are ignored.
    pub fn report_outcome(
        &self,
        id: OperationId,
        success: bool,
        error: Option<&str>,
    ) -> SyncResult<OutcomeEffect> {
        let mut index = self.index.lock();
        let Some(operation) = index.get(&id) else {
            return Ok(OutcomeEffect::Ignored);
        };
        if operation.status == OperationStatus::Failed {
            return Ok(OutcomeEffect::Ignored);
        }

        if success {
            self.store.delete_operation(id)?;
            index.remove(&id);
            debug!(operation_id = %id, "operation delivered");
            return Ok(OutcomeEffect::Removed);
        }

        let attempts = operation.retry_count.saturating_add(1);
        let last_error = error.map(str::to_string);
        let (patch, effect) = if self.retry.is_exhausted(attempts) {
            let patch = OperationPatch::new()
                .status(OperationStatus::Failed)
                .retry_count(attempts)
                .next_attempt_at(None)
                .last_error(last_error);
            (patch, OutcomeEffect::Exhausted)
        } else {
            let at = after(self.clock.now(), self.retry.delay_for_attempt(attempts));
            let patch = OperationPatch::new()
                .status(OperationStatus::Pending)
                .retry_count(attempts)
                .next_attempt_at(Some(at))
                .last_error(last_error);
            (patch, OutcomeEffect::Rescheduled { at })
        };

        self.store.update_operation(id, patch.clone())?;
        if let Some(operation) = index.get_mut(&id) {
            operation.apply_patch(&patch);
            match effect {
                OutcomeEffect::Exhausted => warn!(
                    operation_id = %id,
                    entity_kind = %operation.entity_kind,
                    entity_id = %operation.entity_id,
                    attempts,
                    error = ?operation.last_error,
                    "operation exhausted its attempts"
                ),
                _ => debug!(operation_id = %id, attempts, "operation rescheduled"),
            }
        }
        Ok(effect)
    }

    /// Returns in-flight operations to pending without counting an attempt.
    ///
    /// Used when the pass never reached the server, so the operations were
    /// not judged. `error` is kept as the last error. Returns how many
    /// operations changed.
    pub fn release(&self, ids: &[OperationId], error: Option<&str>) -> SyncResult<usize> {
        let mut index = self.index.lock();
        let patch = OperationPatch::new()
            .status(OperationStatus::Pending)
            .last_error(error.map(str::to_string));
        let released: Vec<OperationId> = ids
            .iter()
            .copied()
            .filter(|id| {
                index
                    .get(id)
                    .is_some_and(|op| op.status == OperationStatus::Processing)
            })
            .collect();
        if released.is_empty() {
            return Ok(0);
        }

        let mut batch = StoreBatch::new();
        for id in &released {
            batch = batch.update_operation(*id, patch.clone());
        }
        self.store.apply_batch(batch)?;
        for id in &released {
            if let Some(operation) = index.get_mut(id) {
                operation.apply_patch(&patch);
            }
        }
        debug!(count = released.len(), "operations released after transport failure");
        Ok(released.len())
    }

    /// Moves every failed operation back to pending with zero attempts.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let mut index = self.index.lock();
        let patch = OperationPatch::new()
            .status(OperationStatus::Pending)
            .retry_count(0)
            .next_attempt_at(None)
            .last_error(None);

        let failed: Vec<OperationId> = index
            .values()
            .filter(|op| op.status == OperationStatus::Failed)
            .map(|op| op.id)
            .collect();
        if failed.is_empty() {
            return Ok(0);
        }

        let mut batch = StoreBatch::new();
        for id in &failed {
            batch = batch.update_operation(*id, patch.clone());
        }
        self.store.apply_batch(batch)?;
        for id in &failed {
            if let Some(operation) = index.get_mut(id) {
                operation.apply_patch(&patch);
            }
        }
        info!(count = failed.len(), "failed operations requeued");
        Ok(failed.len())
    }

    /// Marks operations as in flight.
    pub fn mark_processing(&self, ids: &[OperationId]) -> SyncResult<()> {
        let mut index = self.index.lock();
        let patch = OperationPatch::new().status(OperationStatus::Processing);
        let known: Vec<OperationId> = ids
            .iter()
            .copied()
            .filter(|id| index.contains_key(id))
            .collect();
        if known.is_empty() {
            return Ok(());
        }

        let mut batch = StoreBatch::new();
        for id in &known {
            batch = batch.update_operation(*id, patch.clone());
        }
        self.store.apply_batch(batch)?;
        for id in &known {
            if let Some(operation) = index.get_mut(id) {
                operation.apply_patch(&patch);
            }
        }
        Ok(())
    }

    /// Returns queue counters.
    pub fn stats(&self) -> QueueStats {
        let index = self.index.lock();
        let mut stats = QueueStats {
            total: index.len(),
            ..QueueStats::default()
        };
        for operation in index.values() {
            match operation.status {
                OperationStatus::Pending => {
                    stats.pending += 1;
                    let at = operation.created_at;
                    stats.oldest_pending = Some(stats.oldest_pending.map_or(at, |t| t.min(at)));
                    stats.newest_pending = Some(stats.newest_pending.map_or(at, |t| t.max(at)));
                }
                OperationStatus::Processing => stats.processing += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Completed => {}
            }
        }
        stats
    }

    /// Returns every queued operation in delivery order.
    pub fn items(&self) -> Vec<QueueItem> {
        let index = self.index.lock();
        let mut operations: Vec<&SyncOperation> = index.values().collect();
        operations.sort_by(|a, b| delivery_order(a, b));
        operations.into_iter().map(QueueItem::from).collect()
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Returns true if any unacknowledged operation touches `key`.
    pub fn has_pending_for(&self, key: &EntityKey) -> bool {
        self.index.lock().values().any(|op| op.touches(key))
    }

    /// Returns the unacknowledged operations on `key`, oldest first.
    pub fn pending_for(&self, key: &EntityKey) -> Vec<SyncOperation> {
        let index = self.index.lock();
        let mut operations: Vec<SyncOperation> =
            index.values().filter(|op| op.touches(key)).cloned().collect();
        operations.sort_by(|a, b| (a.created_at, a.sequence).cmp(&(b.created_at, b.sequence)));
        operations
    }

    /// Drops every operation on `key`.
    pub fn discard_for(&self, key: &EntityKey) -> SyncResult<usize> {
        self.commit_with(StoreBatch::new(), &[QueueEdit::Discard(key.clone())])
    }

    /// Replaces the payload of one operation.
    pub fn update_payload(&self, id: OperationId, payload: Value) -> SyncResult<()> {
        let mut index = self.index.lock();
        if !index.contains_key(&id) {
            return Ok(());
        }
        let patch = OperationPatch::new().payload(payload);
        self.store.update_operation(id, patch.clone())?;
        if let Some(operation) = index.get_mut(&id) {
            operation.apply_patch(&patch);
        }
        Ok(())
    }

    /// Commits `batch` together with queue edits in one store write.
    ///
    /// Returns the number of operations the edits touched.
    pub fn commit_with(&self, mut batch: StoreBatch, edits: &[QueueEdit]) -> SyncResult<usize> {
        let mut index = self.index.lock();
        let mut removed = Vec::new();
        let mut carried = Vec::new();

        for edit in edits {
            match edit {
                QueueEdit::Discard(key) => {
                    for operation in index.values().filter(|op| op.touches(key)) {
                        batch = batch.delete_operation(operation.id);
                        removed.push(operation.id);
                    }
                }
                QueueEdit::CarryPayload(key, payload) => {
                    let latest = index
                        .values()
                        .filter(|op| op.touches(key))
                        .max_by_key(|op| (op.created_at, op.sequence));
                    if let Some(operation) = latest {
                        let patch = OperationPatch::new().payload(payload.clone());
                        batch = batch.update_operation(operation.id, patch.clone());
                        carried.push((operation.id, patch));
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.store.apply_batch(batch)?;
        }
        for id in &removed {
            index.remove(id);
        }
        for (id, patch) in &carried {
            if let Some(operation) = index.get_mut(id) {
                operation.apply_patch(patch);
            }
        }
        Ok(removed.len() + carried.len())
    }

    /// Groups a delivery batch into one effective change per entity.
    ///
    /// Each entity's group includes every other unacknowledged,
    /// non-failed operation on it so a partial batch never uploads an
    /// `Update` ahead of its `Create`. Groups keep the batch's order.
    pub fn effective_changes(&self, batch: &[SyncOperation]) -> Vec<EffectiveChange> {
        let index = self.index.lock();
        let mut seen: Vec<EntityKey> = Vec::new();
        let mut changes = Vec::new();
        for operation in batch {
            let key = operation.key();
            if seen.contains(&key) {
                continue;
            }
            let mut group: Vec<&SyncOperation> = index
                .values()
                .filter(|op| op.touches(&key) && op.status != OperationStatus::Failed)
                .collect();
            group.sort_by(|a, b| (a.created_at, a.sequence).cmp(&(b.created_at, b.sequence)));
            let group: Vec<SyncOperation> = group.into_iter().cloned().collect();
            if let Some(change) = EffectiveChange::fold(&group) {
                changes.push(change);
            }
            seen.push(key);
        }
        changes
    }
}

fn delivery_order(a: &SyncOperation, b: &SyncOperation) -> std::cmp::Ordering {
    (a.op_type.priority(), a.created_at, a.sequence).cmp(&(
        b.op_type.priority(),
        b.created_at,
        b.sequence,
    ))
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use offsync_protocol::{ManualClock, NewOperation};
    use offsync_store::MemoryStore;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn setup(retry: RetryConfig) -> (Arc<MemoryStore>, Arc<ManualClock>, OperationQueue) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let queue = OperationQueue::open(store.clone(), clock.clone(), retry).unwrap();
        (store, clock, queue)
    }

    fn enqueue(queue: &OperationQueue, clock: &ManualClock, op: NewOperation) -> SyncOperation {
        queue.enqueue(op.into_operation(clock.now())).unwrap()
    }

    #[test]
    fn deletes_before_creates_before_updates() {
        let (_store, clock, queue) = setup(RetryConfig::queue());
        let update = enqueue(&queue, &clock, NewOperation::update("Customer", "1", json!({})));
        clock.advance_millis(1);
        let create = enqueue(&queue, &clock, NewOperation::create("Customer", "2", json!({})));
        clock.advance_millis(1);
        let delete = enqueue(&queue, &clock, NewOperation::delete("Customer", "3"));

        let ids: Vec<OperationId> = queue.next_batch(10).iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![delete.id, create.id, update.id]);
    }

    #[test]
    fn next_batch_respects_max() {
        let (_store, clock, queue) = setup(RetryConfig::queue());
        for i in 0..5 {
            enqueue(&queue, &clock, NewOperation::create("Item", i.to_string(), json!({})));
        }
        assert_eq!(queue.next_batch(3).len(), 3);
        assert_eq!(queue.next_batch(50).len(), 5);
    }

    #[test]
    fn three_failures_exhaust_and_fourth_is_noop() {
        let (store, clock, queue) = setup(RetryConfig::queue());
        let op = enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({})));

        assert!(matches!(
            queue.report_outcome(op.id, false, Some("offline")).unwrap(),
            OutcomeEffect::Rescheduled { .. }
        ));
        clock.advance_millis(60_000);
        assert!(matches!(
            queue.report_outcome(op.id, false, Some("offline")).unwrap(),
            OutcomeEffect::Rescheduled { .. }
        ));
        clock.advance_millis(60_000);
        assert_eq!(
            queue.report_outcome(op.id, false, Some("offline")).unwrap(),
            OutcomeEffect::Exhausted
        );

        clock.advance_millis(60_000);
        assert!(queue.next_batch(10).is_empty());
        assert_eq!(
            queue.report_outcome(op.id, false, Some("offline")).unwrap(),
            OutcomeEffect::Ignored
        );

        let stored = store.get_operation(op.id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("offline"));
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let (_store, clock, queue) = setup(RetryConfig::queue().with_max_attempts(5));
        let op = enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({})));

        for expected in [1000, 2000, 4000] {
            let failed_at = clock.now();
            let effect = queue.report_outcome(op.id, false, None).unwrap();
            let OutcomeEffect::Rescheduled { at } = effect else {
                panic!("expected reschedule, got {effect:?}");
            };
            assert_eq!((at - failed_at).num_milliseconds(), expected);

            clock.advance_millis(expected - 1);
            assert!(queue.next_batch(10).is_empty());
            clock.advance_millis(1);
            assert_eq!(queue.next_batch(10).len(), 1);
        }
    }

    #[test]
    fn success_removes_operation() {
        let (store, clock, queue) = setup(RetryConfig::queue());
        let op = enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({})));

        assert_eq!(queue.report_outcome(op.id, true, None).unwrap(), OutcomeEffect::Removed);
        assert!(queue.is_empty());
        assert!(store.get_operation(op.id).unwrap().is_none());
        assert_eq!(
            queue.report_outcome(op.id, true, None).unwrap(),
            OutcomeEffect::Ignored
        );
    }

    #[test]
    fn stats_and_retry_failed() {
        let (_store, clock, queue) = setup(RetryConfig::queue());
        let op = enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({})));
        clock.advance_millis(5);
        enqueue(&queue, &clock, NewOperation::update("Customer", "2", json!({})));
        for _ in 0..3 {
            queue.report_outcome(op.id, false, Some("boom")).unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.oldest_pending, Some(start() + chrono::Duration::milliseconds(5)));

        assert_eq!(queue.retry_failed().unwrap(), 1);
        let item = queue
            .items()
            .into_iter()
            .find(|item| item.operation.id == op.id)
            .unwrap();
        assert_eq!(item.operation.status, OperationStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.last_error, None);
        assert_eq!(queue.stats().failed, 0);
    }

    #[test]
    fn storage_failure_indexes_nothing() {
        let (store, clock, queue) = setup(RetryConfig::queue());
        store.fail_writes(true);
        let op = NewOperation::create("Customer", "1", json!({})).into_operation(clock.now());
        assert!(queue.enqueue(op).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn reopen_resets_processing() {
        let (store, clock, queue) = setup(RetryConfig::queue());
        let op = enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({})));
        queue.mark_processing(&[op.id]).unwrap();
        assert_eq!(queue.stats().processing, 1);
        assert!(queue.next_batch(10).is_empty());
        drop(queue);

        let reopened = OperationQueue::open(store.clone(), clock, RetryConfig::queue()).unwrap();
        assert_eq!(reopened.stats().pending, 1);
        assert_eq!(
            store.get_operation(op.id).unwrap().unwrap().status,
            OperationStatus::Pending
        );
    }

    #[test]
    fn release_keeps_attempts_untouched() {
        let (store, clock, queue) = setup(RetryConfig::queue());
        let op = enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({})));

        for _ in 0..5 {
            queue.mark_processing(&[op.id]).unwrap();
            assert_eq!(queue.release(&[op.id], Some("not connected to server")).unwrap(), 1);
        }

        let batch = queue.next_batch(10);
        assert_eq!(batch.len(), 1);
        let stored = store.get_operation(op.id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.next_attempt_at, None);
        assert_eq!(stored.last_error.as_deref(), Some("not connected to server"));

        // Only in-flight operations are released
        assert_eq!(queue.release(&[op.id], None).unwrap(), 0);
    }

    #[test]
    fn held_entities_do_not_take_batch_slots() {
        let (_store, clock, queue) = setup(RetryConfig::queue());
        enqueue(&queue, &clock, NewOperation::update("Customer", "2", json!({"a": 1})));
        clock.advance_millis(1);
        let other = enqueue(&queue, &clock, NewOperation::update("Customer", "5", json!({"a": 2})));

        let held: HashSet<EntityKey> = [EntityKey::new("Customer", "2")].into_iter().collect();
        let batch = queue.next_batch_excluding(1, &held);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, other.id);
        assert_eq!(queue.next_batch(1)[0].entity_id, "2");
    }

    #[test]
    fn create_then_update_folds_into_create() {
        let (_store, clock, queue) = setup(RetryConfig::queue());
        enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({"name": "A"})));
        clock.advance_millis(1);
        enqueue(&queue, &clock, NewOperation::update("Customer", "1", json!({"name": "B"})));

        // Only the create fits, the update still joins its group
        let batch = queue.next_batch(1);
        let changes = queue.effective_changes(&batch);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op_type, Some(OperationType::Create));
        assert_eq!(changes[0].payload, json!({"name": "B"}));
        assert_eq!(changes[0].operation_ids.len(), 2);
    }

    #[test]
    fn create_then_delete_cancels() {
        let (_store, clock, queue) = setup(RetryConfig::queue());
        enqueue(&queue, &clock, NewOperation::create("Customer", "1", json!({})));
        clock.advance_millis(1);
        enqueue(&queue, &clock, NewOperation::delete("Customer", "1"));

        let changes = queue.effective_changes(&queue.next_batch(10));
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_cancelled());
        assert_eq!(changes[0].payload, Value::Null);
    }

    #[test]
    fn discard_and_carry_payload() {
        let (store, clock, queue) = setup(RetryConfig::queue());
        let key = EntityKey::new("Customer", "1");
        enqueue(&queue, &clock, NewOperation::update("Customer", "1", json!({"a": 1})));
        clock.advance_millis(1);
        let latest = enqueue(&queue, &clock, NewOperation::update("Customer", "1", json!({"a": 2})));

        let touched = queue
            .commit_with(StoreBatch::new(), &[QueueEdit::CarryPayload(key.clone(), json!({"a": 3}))])
            .unwrap();
        assert_eq!(touched, 1);
        assert_eq!(
            store.get_operation(latest.id).unwrap().unwrap().payload,
            json!({"a": 3})
        );

        assert_eq!(queue.discard_for(&key).unwrap(), 2);
        assert!(!queue.has_pending_for(&key));
        assert!(store.list_operations(None).unwrap().is_empty());
    }

    fn op_type_strategy() -> impl Strategy<Value = NewOperationKind> {
        prop_oneof![
            Just(NewOperationKind::Create),
            Just(NewOperationKind::Update),
            Just(NewOperationKind::Delete),
        ]
    }

    #[derive(Debug, Clone, Copy)]
    enum NewOperationKind {
        Create,
        Update,
        Delete,
    }

    proptest! {
        #[test]
        fn batches_sorted_by_priority_then_creation(
            kinds in prop::collection::vec((op_type_strategy(), 0i64..3), 1..40)
        ) {
            let (_store, clock, queue) = setup(RetryConfig::queue());
            for (i, (kind, step)) in kinds.iter().enumerate() {
                clock.advance_millis(*step);
                let id = i.to_string();
                let op = match kind {
                    NewOperationKind::Create => NewOperation::create("Item", id, json!({})),
                    NewOperationKind::Update => NewOperation::update("Item", id, json!({})),
                    NewOperationKind::Delete => NewOperation::delete("Item", id),
                };
                enqueue(&queue, &clock, op);
            }

            let batch = queue.next_batch(usize::MAX);
            prop_assert_eq!(batch.len(), kinds.len());
            for pair in batch.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.op_type.priority() <= b.op_type.priority());
                if a.op_type.priority() == b.op_type.priority() {
                    prop_assert!(a.sequence < b.sequence);
                    prop_assert!(a.created_at <= b.created_at);
                }
            }
        }
    }
}
