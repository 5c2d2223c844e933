//! Applying server changes to local state.
//!
//! Downloaded changes and push updates take the same path:
//!
//! 1. An entity with an open conflict has the conflict's server side
//!    replaced and re-analysed; no second conflict is opened.
//! 2. An entity without unacknowledged local operations is overwritten
//!    (or removed) directly.
//! 3. Otherwise the local and server sides are compared. Without a
//!    conflict the local intent is kept and the server version adopted;
//!    with one, the resolution pipeline runs and either closes it or
//!    leaves it open for a human.
//!
//! Applies run one at a time. Pulls and push updates arrive on different
//! tasks, and each apply reads an entity's state before writing it. Local
//! writes with the same shape go through [`ChangeApplier::exclusive`].
//! Events are emitted after the lock is released.

use crate::error::SyncResult;
use crate::events::{ListenerRegistry, SyncEvent};
use crate::queue::{OperationQueue, QueueEdit};
use offsync_conflict::{ConflictOutcome, ConflictResolver};
use offsync_protocol::{
    Clock, Conflict, ConflictId, EntityKey, EntitySnapshot, NewOperation, OperationType,
    RemoteChange, ResolutionChoice, SyncOperation,
};
use offsync_store::{LocalStore, StoreBatch};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Where a server change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Downloaded during a sync pass.
    Download,
    /// Delivered over the push channel.
    Push,
}

/// What applying one server change did.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The snapshot was overwritten or removed.
    Applied,
    /// Older than the local copy; nothing changed.
    Stale,
    /// No conflict; the local intent stays queued on the new server version.
    Adopted,
    /// A strategy closed the conflict.
    AutoResolved {
        /// The closed conflict.
        conflict_id: ConflictId,
        /// Strategy that closed it.
        strategy: String,
    },
    /// The conflict is open and waits for a decision.
    ConflictOpen(Conflict),
}

/// Writes server changes into the local store.
pub struct ChangeApplier {
    store: Arc<dyn LocalStore>,
    queue: Arc<OperationQueue>,
    resolver: Arc<ConflictResolver>,
    clock: Arc<dyn Clock>,
    events: ListenerRegistry<SyncEvent>,
    serial: Mutex<()>,
}

impl std::fmt::Debug for ChangeApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeApplier")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl ChangeApplier {
    /// Creates an applier.
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<OperationQueue>,
        resolver: Arc<ConflictResolver>,
        clock: Arc<dyn Clock>,
        events: ListenerRegistry<SyncEvent>,
    ) -> Self {
        Self {
            store,
            queue,
            resolver,
            clock,
            events,
            serial: Mutex::new(()),
        }
    }

    /// Runs `f` while no server change is being applied.
    ///
    /// Must not be called from inside `f` or from an event listener that
    /// fires during an apply.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _serial = self.serial.lock();
        f()
    }

    /// Returns the resolver.
    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Applies one server change.
    pub fn apply(&self, change: &RemoteChange, source: ChangeSource) -> SyncResult<ApplyOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let _serial = self.serial.lock();
            self.apply_serialized(change, source, &mut events)
        };
        for event in &events {
            self.events.emit(event);
        }
        outcome
    }

    fn apply_serialized(
        &self,
        change: &RemoteChange,
        source: ChangeSource,
        events: &mut Vec<SyncEvent>,
    ) -> SyncResult<ApplyOutcome> {
        let key = change.key();
        let server = change.to_snapshot();

        if let Some(open) = self.resolver.open_conflict_for(&key)? {
            let outcome = self.resolver.supersede(open, server);
            return self.settle(outcome, true, events);
        }

        let pending = self.queue.pending_for(&key);
        let stored = self.store.get(&key.kind, &key.id)?;

        if pending.is_empty() {
            if is_stale(stored.as_ref(), &server) {
                debug!(entity_kind = %key.kind, entity_id = %key.id, "ignoring stale server change");
                return Ok(ApplyOutcome::Stale);
            }
            self.store.apply_batch(write_snapshot(StoreBatch::new(), server))?;
            debug!(entity_kind = %key.kind, entity_id = %key.id, ?source, "server change applied");
            events.push(SyncEvent::ChangeApplied { key, source });
            return Ok(ApplyOutcome::Applied);
        }

        let local = local_side(&key, stored, &pending);
        match self.resolver.detect(&local, &server) {
            None => {
                let mut adopted = local;
                if server.version.is_some() {
                    adopted.version = server.version;
                }
                self.store.apply_batch(write_snapshot(StoreBatch::new(), adopted))?;
                debug!(entity_kind = %key.kind, entity_id = %key.id, "server version adopted under local intent");
                Ok(ApplyOutcome::Adopted)
            }
            Some(conflict_type) => {
                let outcome = self.resolver.evaluate(local, server, conflict_type);
                self.settle(outcome, false, events)
            }
        }
    }

    /// Applies a batch of changes in order.
    pub fn apply_all(
        &self,
        changes: &[RemoteChange],
        source: ChangeSource,
    ) -> SyncResult<Vec<ApplyOutcome>> {
        changes
            .iter()
            .map(|change| self.apply(change, source))
            .collect()
    }

    fn settle(
        &self,
        outcome: ConflictOutcome,
        superseded: bool,
        events: &mut Vec<SyncEvent>,
    ) -> SyncResult<ApplyOutcome> {
        let mut batch = StoreBatch::new();
        outcome.stage(&mut batch);

        let Some(record) = outcome.record else {
            self.store.apply_batch(batch)?;
            let event = if superseded {
                SyncEvent::ConflictUpdated(outcome.conflict.clone())
            } else {
                SyncEvent::ConflictDetected(outcome.conflict.clone())
            };
            events.push(event);
            return Ok(ApplyOutcome::ConflictOpen(outcome.conflict));
        };

        self.commit_resolution(&outcome.conflict, batch)?;
        events.push(SyncEvent::ConflictResolved(record.clone()));
        Ok(ApplyOutcome::AutoResolved {
            conflict_id: outcome.conflict.id,
            strategy: record.strategy.unwrap_or_default(),
        })
    }

    /// Writes the outcome of a closed conflict together with `batch`.
    ///
    /// Callers outside an apply wrap this in [`exclusive`](Self::exclusive).
    ///
    /// - `Server`: the server snapshot wins and local intents are dropped.
    /// - `Local`: the local snapshot stays on the server's version and its
    ///   intent is uploaded.
    /// - `Merge`/`Manual`: the resolved document is written and uploaded.
    pub fn commit_resolution(&self, conflict: &Conflict, batch: StoreBatch) -> SyncResult<()> {
        let key = conflict.key();
        let server = &conflict.server_version;
        let choice = conflict.resolution.unwrap_or(ResolutionChoice::Manual);

        if choice == ResolutionChoice::Server {
            let batch = write_snapshot(batch, server.clone());
            self.queue.commit_with(batch, &[QueueEdit::Discard(key)])?;
            return Ok(());
        }

        let data = match choice {
            ResolutionChoice::Local => conflict.local_version.data.clone(),
            _ => conflict.resolved_data.clone().unwrap_or(Value::Null),
        };
        let snapshot = EntitySnapshot {
            id: key.id.clone(),
            kind: key.kind.clone(),
            data: data.clone(),
            last_modified: conflict.resolved_at.unwrap_or_else(|| self.clock.now()),
            version: server.version,
        };
        let batch = write_snapshot(batch, snapshot);

        if self.queue.has_pending_for(&key) {
            self.queue
                .commit_with(batch, &[QueueEdit::CarryPayload(key, data)])?;
        } else {
            let operation = if data.is_null() {
                NewOperation::delete(key.kind, key.id)
            } else {
                NewOperation::update(key.kind, key.id, data)
            };
            self.queue
                .enqueue_with(operation.into_operation(self.clock.now()), batch)?;
        }
        Ok(())
    }
}

/// Builds the local side of a comparison.
///
/// A pending delete is a tombstone; an entity only known from its queued
/// operation is materialized from the latest payload.
fn local_side(
    key: &EntityKey,
    stored: Option<EntitySnapshot>,
    pending: &[SyncOperation],
) -> EntitySnapshot {
    let latest = pending.last();
    let base_version = stored.as_ref().and_then(|s| s.version);
    match (stored, latest) {
        (_, Some(op)) if op.op_type == OperationType::Delete => EntitySnapshot {
            id: key.id.clone(),
            kind: key.kind.clone(),
            data: Value::Null,
            last_modified: op.created_at,
            version: base_version,
        },
        (Some(snapshot), _) => snapshot,
        (None, Some(op)) => {
            EntitySnapshot::new(key.kind.clone(), key.id.clone(), op.payload.clone(), op.created_at)
        }
        (None, None) => EntitySnapshot::new(
            key.kind.clone(),
            key.id.clone(),
            Value::Null,
            chrono::DateTime::<chrono::Utc>::MIN_UTC,
        ),
    }
}

fn is_stale(stored: Option<&EntitySnapshot>, server: &EntitySnapshot) -> bool {
    match (stored.and_then(|s| s.version), server.version) {
        (Some(local), Some(incoming)) => incoming < local,
        _ => false,
    }
}

fn write_snapshot(batch: StoreBatch, snapshot: EntitySnapshot) -> StoreBatch {
    if snapshot.is_tombstone() {
        batch.delete(snapshot.key())
    } else {
        batch.put(snapshot)
    }
}
