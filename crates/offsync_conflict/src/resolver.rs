//! Conflict lifecycle: open, auto-resolve, manual resolve, history, pruning.

use crate::analysis::{detect_conflict, ConflictAnalysis, ConflictAnalyzer};
use crate::error::{ConflictError, ConflictResult};
use chrono::{DateTime, Duration, Utc};
use offsync_protocol::{
    Clock, Conflict, ConflictId, ConflictType, EntityKey, EntitySnapshot, ResolutionChoice,
    ResolutionRecord, Severity,
};
use offsync_store::{BatchOp, ConflictFilter, LocalStore, StoreBatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name recorded as `resolved_by` for human decisions.
pub const MANUAL_RESOLVER: &str = "manual";

/// Default retention of resolved conflicts.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// A human decision on an open conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualResolution {
    /// Which side to keep, or how to combine them.
    pub choice: ResolutionChoice,
    /// The final document; required for `merge` and `manual`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Free-form notes kept with the conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ManualResolution {
    /// Keep the local version.
    pub fn local() -> Self {
        Self {
            choice: ResolutionChoice::Local,
            data: None,
            notes: None,
        }
    }

    /// Accept the server version.
    pub fn server() -> Self {
        Self {
            choice: ResolutionChoice::Server,
            data: None,
            notes: None,
        }
    }

    /// Keep a merged document.
    pub fn merge(data: Value) -> Self {
        Self {
            choice: ResolutionChoice::Merge,
            data: Some(data),
            notes: None,
        }
    }

    /// Keep a hand-written document.
    pub fn manual(data: Value) -> Self {
        Self {
            choice: ResolutionChoice::Manual,
            data: Some(data),
            notes: None,
        }
    }

    /// Attaches notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// The result of evaluating a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictOutcome {
    /// The conflict, closed if a strategy resolved it.
    pub conflict: Conflict,
    /// The analysis it was evaluated with.
    pub analysis: ConflictAnalysis,
    /// History entry, present when the conflict was closed.
    pub record: Option<ResolutionRecord>,
}

impl ConflictOutcome {
    /// Returns true if a strategy closed the conflict.
    pub fn is_resolved(&self) -> bool {
        self.conflict.resolved
    }

    /// Adds the conflict and its history entry to `batch`.
    pub fn stage(&self, batch: &mut StoreBatch) {
        stage(&self.conflict, self.record.as_ref(), batch);
    }
}

/// A conflict closed by a human decision, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    /// The closed conflict.
    pub conflict: Conflict,
    /// Its history entry.
    pub record: ResolutionRecord,
}

impl ResolvedConflict {
    /// The document that was kept.
    pub fn data(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.conflict.resolved_data.as_ref().unwrap_or(&NULL)
    }

    /// Adds the conflict and its history entry to `batch`.
    pub fn stage(&self, batch: &mut StoreBatch) {
        stage(&self.conflict, Some(&self.record), batch);
    }
}

fn stage(conflict: &Conflict, record: Option<&ResolutionRecord>, batch: &mut StoreBatch) {
    batch.push(BatchOp::PutConflict(conflict.clone()));
    if let Some(record) = record {
        batch.push(BatchOp::AppendResolution(record.clone()));
    }
}

/// How often one strategy closed conflicts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    /// Strategy name, or `manual`.
    pub strategy: String,
    /// Conflicts it resolved.
    pub resolved: usize,
    /// Fraction of all resolutions in the window.
    pub share: f64,
}

/// Opens, resolves, records and prunes conflicts.
pub struct ConflictResolver {
    store: Arc<dyn LocalStore>,
    analyzer: ConflictAnalyzer,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("analyzer", &self.analyzer)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Creates a resolver with the built-in strategies.
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            analyzer: ConflictAnalyzer::new(),
            clock,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    /// Replaces the analyzer.
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: ConflictAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Sets how long resolved conflicts are kept.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Returns the analyzer.
    pub fn analyzer(&self) -> &ConflictAnalyzer {
        &self.analyzer
    }

    /// Returns the analyzer for strategy registration.
    pub fn analyzer_mut(&mut self) -> &mut ConflictAnalyzer {
        &mut self.analyzer
    }

    /// Decides whether the two sides conflict.
    pub fn detect(&self, local: &EntitySnapshot, server: &EntitySnapshot) -> Option<ConflictType> {
        detect_conflict(local, server)
    }

    /// Opens a conflict and runs the strategy pipeline on it.
    ///
    /// Nothing is persisted; stage the outcome into a batch.
    pub fn evaluate(
        &self,
        local: EntitySnapshot,
        server: EntitySnapshot,
        conflict_type: ConflictType,
    ) -> ConflictOutcome {
        let conflict = Conflict::open(local, server, conflict_type, self.clock.now());
        self.run(conflict)
    }

    /// Replaces the server side of an open conflict and re-evaluates it.
    pub fn supersede(&self, mut conflict: Conflict, server: EntitySnapshot) -> ConflictOutcome {
        tracing::debug!(
            conflict_id = %conflict.id,
            entity_kind = %conflict.entity_kind,
            entity_id = %conflict.entity_id,
            "server change supersedes open conflict"
        );
        conflict.server_version = server;
        self.run(conflict)
    }

    fn run(&self, mut conflict: Conflict) -> ConflictOutcome {
        let analysis = self
            .analyzer
            .analyze(&conflict.local_version, &conflict.server_version);

        let record = analysis.auto_resolution.as_ref().map(|resolution| {
            let now = self.clock.now();
            close(
                &mut conflict,
                resolution.choice,
                resolution.data.clone(),
                &resolution.strategy,
                None,
                now,
            );
            tracing::info!(
                conflict_id = %conflict.id,
                entity_kind = %conflict.entity_kind,
                entity_id = %conflict.entity_id,
                strategy = %resolution.strategy,
                choice = %resolution.choice,
                "conflict resolved automatically"
            );
            record_for(&conflict, Some(resolution.strategy.clone()), true, analysis.severity, now)
        });

        if record.is_none() {
            tracing::info!(
                conflict_id = %conflict.id,
                entity_kind = %conflict.entity_kind,
                entity_id = %conflict.entity_id,
                severity = %analysis.severity,
                "conflict requires manual resolution"
            );
        }

        ConflictOutcome {
            conflict,
            analysis,
            record,
        }
    }

    /// Validates a human decision and closes the conflict in memory.
    ///
    /// # Errors
    ///
    /// - [`ConflictError::NotFound`] for an unknown id
    /// - [`ConflictError::AlreadyResolved`] if the conflict is closed
    /// - [`ConflictError::InvalidResolution`] if `merge`/`manual` lacks data
    pub fn prepare_manual(
        &self,
        id: ConflictId,
        resolution: ManualResolution,
    ) -> ConflictResult<ResolvedConflict> {
        let mut conflict = self
            .store
            .get_conflict(id)?
            .ok_or(ConflictError::NotFound(id))?;
        if conflict.resolved {
            return Err(ConflictError::AlreadyResolved(id));
        }

        let data = match resolution.choice {
            ResolutionChoice::Local => conflict.local_version.data.clone(),
            ResolutionChoice::Server => conflict.server_version.data.clone(),
            ResolutionChoice::Merge | ResolutionChoice::Manual => {
                resolution.data.clone().ok_or_else(|| {
                    ConflictError::InvalidResolution(format!(
                        "{} resolution requires data",
                        resolution.choice
                    ))
                })?
            }
        };

        let severity = self
            .analyzer
            .analyze(&conflict.local_version, &conflict.server_version)
            .severity;
        let now = self.clock.now();
        close(
            &mut conflict,
            resolution.choice,
            data,
            MANUAL_RESOLVER,
            resolution.notes,
            now,
        );
        let record = record_for(&conflict, None, false, severity, now);

        Ok(ResolvedConflict { conflict, record })
    }

    /// Closes a conflict by a human decision and persists it.
    ///
    /// Only the conflict and its history entry are written; callers that
    /// must update snapshots in the same unit use [`Self::prepare_manual`].
    ///
    /// # Errors
    ///
    /// See [`Self::prepare_manual`]; storage failures are propagated.
    pub fn resolve_manual(
        &self,
        id: ConflictId,
        resolution: ManualResolution,
    ) -> ConflictResult<ResolvedConflict> {
        let resolved = self.prepare_manual(id, resolution)?;
        let mut batch = StoreBatch::new();
        resolved.stage(&mut batch);
        self.store.apply_batch(batch)?;
        Ok(resolved)
    }

    /// Returns one conflict.
    pub fn get(&self, id: ConflictId) -> ConflictResult<Option<Conflict>> {
        Ok(self.store.get_conflict(id)?)
    }

    /// Returns every open conflict, oldest first.
    pub fn open_conflicts(&self) -> ConflictResult<Vec<Conflict>> {
        Ok(self.store.list_conflicts(&ConflictFilter::open())?)
    }

    /// Returns the open conflict on `key`, if any.
    pub fn open_conflict_for(&self, key: &EntityKey) -> ConflictResult<Option<Conflict>> {
        let filter = ConflictFilter::open().for_key(key.clone());
        Ok(self.store.list_conflicts(&filter)?.into_iter().next())
    }

    /// Returns the resolution history, optionally for one kind.
    pub fn history(&self, kind: Option<&str>) -> ConflictResult<Vec<ResolutionRecord>> {
        Ok(self.store.list_resolutions(kind)?)
    }

    /// Summarizes how conflicts were resolved, most used strategy first.
    pub fn strategy_stats(&self, kind: Option<&str>) -> ConflictResult<Vec<StrategyStats>> {
        let history = self.history(kind)?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &history {
            let name = record
                .strategy
                .clone()
                .unwrap_or_else(|| MANUAL_RESOLVER.to_string());
            *counts.entry(name).or_default() += 1;
        }

        let total = history.len().max(1) as f64;
        let mut stats: Vec<StrategyStats> = counts
            .into_iter()
            .map(|(strategy, resolved)| StrategyStats {
                strategy,
                resolved,
                share: resolved as f64 / total,
            })
            .collect();
        stats.sort_by(|a, b| b.resolved.cmp(&a.resolved).then(a.strategy.cmp(&b.strategy)));
        Ok(stats)
    }

    /// Deletes resolved conflicts older than the retention window.
    ///
    /// The resolution history is kept. Returns the number of conflicts
    /// removed.
    pub fn prune(&self) -> ConflictResult<usize> {
        self.prune_before(self.clock.now() - self.retention)
    }

    /// Deletes resolved conflicts closed before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> ConflictResult<usize> {
        let mut batch = StoreBatch::new();
        for conflict in self.store.list_conflicts(&ConflictFilter::resolved())? {
            let closed = conflict.resolved_at.unwrap_or(conflict.detected_at);
            if closed < cutoff {
                batch = batch.delete_conflict(conflict.id);
            }
        }
        let pruned = batch.len();
        if pruned > 0 {
            self.store.apply_batch(batch)?;
            tracing::info!(pruned, %cutoff, "pruned resolved conflicts");
        }
        Ok(pruned)
    }
}

fn close(
    conflict: &mut Conflict,
    choice: ResolutionChoice,
    data: Value,
    resolved_by: &str,
    notes: Option<String>,
    at: DateTime<Utc>,
) {
    conflict.resolved = true;
    conflict.resolution = Some(choice);
    conflict.resolved_data = Some(data);
    conflict.resolved_at = Some(at);
    conflict.resolved_by = Some(resolved_by.to_string());
    conflict.notes = notes;
}

fn record_for(
    conflict: &Conflict,
    strategy: Option<String>,
    automatic: bool,
    severity: Severity,
    at: DateTime<Utc>,
) -> ResolutionRecord {
    ResolutionRecord {
        conflict_id: conflict.id,
        entity_kind: conflict.entity_kind.clone(),
        entity_id: conflict.entity_id.clone(),
        choice: conflict.resolution.unwrap_or(ResolutionChoice::Manual),
        strategy,
        automatic,
        severity,
        resolved_at: at,
        notes: conflict.notes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::ManualClock;
    use offsync_store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, ConflictResolver) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let resolver = ConflictResolver::new(store.clone(), clock.clone());
        (store, clock, resolver)
    }

    fn customer(email: &str, version: u64) -> EntitySnapshot {
        EntitySnapshot::new("Customer", "2", json!({"name": "Ada", "email": email}), Utc::now())
            .with_version(version)
    }

    fn open_email_conflict(store: &MemoryStore, resolver: &ConflictResolver) -> ConflictId {
        let outcome = resolver.evaluate(
            customer("a@x.com", 1),
            customer("b@x.com", 2),
            ConflictType::Version,
        );
        assert!(!outcome.is_resolved());
        let mut batch = StoreBatch::new();
        outcome.stage(&mut batch);
        store.apply_batch(batch).unwrap();
        outcome.conflict.id
    }

    #[test]
    fn stock_conflict_closes_automatically() {
        let (_, _, resolver) = setup();
        let now = Utc::now();
        let local = EntitySnapshot::new("ProductVariant", "3", json!({"stockQuantity": 10}), now)
            .with_version(1);
        let server = EntitySnapshot::new("ProductVariant", "3", json!({"stockQuantity": 7}), now)
            .with_version(2);

        let outcome = resolver.evaluate(local, server, ConflictType::Version);
        assert!(outcome.is_resolved());
        assert_eq!(outcome.conflict.resolved_data, Some(json!({"stockQuantity": 10})));
        assert_eq!(outcome.conflict.resolved_by.as_deref(), Some("quantity_merge"));
        let record = outcome.record.unwrap();
        assert!(record.automatic);
        assert_eq!(record.choice, ResolutionChoice::Merge);
    }

    #[test]
    fn manual_resolution_is_final() {
        let (store, _, resolver) = setup();
        let id = open_email_conflict(&store, &resolver);

        let resolved = resolver
            .resolve_manual(id, ManualResolution::server().with_notes("customer confirmed"))
            .unwrap();
        assert_eq!(resolved.data()["email"], "b@x.com");
        assert_eq!(resolved.record.severity, Severity::High);

        let stored = resolver.get(id).unwrap().unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.notes.as_deref(), Some("customer confirmed"));
        assert!(resolver.open_conflicts().unwrap().is_empty());

        assert!(matches!(
            resolver.resolve_manual(id, ManualResolution::local()),
            Err(ConflictError::AlreadyResolved(_))
        ));
        assert_eq!(resolver.history(Some("Customer")).unwrap().len(), 1);
    }

    #[test]
    fn merge_requires_data() {
        let (store, _, resolver) = setup();
        let id = open_email_conflict(&store, &resolver);

        let missing = ManualResolution {
            choice: ResolutionChoice::Merge,
            data: None,
            notes: None,
        };
        assert!(matches!(
            resolver.resolve_manual(id, missing),
            Err(ConflictError::InvalidResolution(_))
        ));
        assert!(resolver.get(id).unwrap().unwrap().is_open());

        let merged = resolver
            .resolve_manual(id, ManualResolution::merge(json!({"name": "Ada", "email": "c@x.com"})))
            .unwrap();
        assert_eq!(merged.conflict.resolution, Some(ResolutionChoice::Merge));
    }

    #[test]
    fn unknown_conflict_is_not_found() {
        let (_, _, resolver) = setup();
        assert!(matches!(
            resolver.resolve_manual(ConflictId::new(), ManualResolution::local()),
            Err(ConflictError::NotFound(_))
        ));
    }

    #[test]
    fn supersede_replaces_server_side() {
        let (store, _, resolver) = setup();
        let id = open_email_conflict(&store, &resolver);
        let conflict = resolver.get(id).unwrap().unwrap();

        let outcome = resolver.supersede(conflict, customer("d@x.com", 3));
        assert_eq!(outcome.conflict.id, id);
        assert_eq!(outcome.conflict.server_version.data["email"], "d@x.com");
        assert!(!outcome.is_resolved());
    }

    #[test]
    fn stats_count_strategies_and_manual() {
        let (store, _, resolver) = setup();
        let now = Utc::now();
        for stock in [1, 2] {
            let outcome = resolver.evaluate(
                EntitySnapshot::new("Product", "1", json!({"stock": stock}), now).with_version(1),
                EntitySnapshot::new("Product", "1", json!({"stock": 5}), now).with_version(2),
                ConflictType::Version,
            );
            let mut batch = StoreBatch::new();
            outcome.stage(&mut batch);
            store.apply_batch(batch).unwrap();
        }
        let id = open_email_conflict(&store, &resolver);
        resolver.resolve_manual(id, ManualResolution::local()).unwrap();

        let stats = resolver.strategy_stats(None).unwrap();
        assert_eq!(stats[0].strategy, "quantity_merge");
        assert_eq!(stats[0].resolved, 2);
        assert_eq!(stats[1].strategy, MANUAL_RESOLVER);
        assert!((stats[0].share - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn prune_drops_only_old_resolved_conflicts() {
        let (store, clock, resolver) = setup();
        let old = open_email_conflict(&store, &resolver);
        resolver.resolve_manual(old, ManualResolution::local()).unwrap();
        let open = open_email_conflict(&store, &resolver);

        clock.advance(Duration::days(DEFAULT_RETENTION_DAYS + 1));
        assert_eq!(resolver.prune().unwrap(), 1);
        assert!(resolver.get(old).unwrap().is_none());
        assert!(resolver.get(open).unwrap().is_some());
        // History survives pruning.
        assert_eq!(resolver.history(None).unwrap().len(), 1);
    }
}
