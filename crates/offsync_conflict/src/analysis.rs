//! Conflict detection, severity and risk scoring.

use crate::diff::{diff_documents, FieldDiff};
use crate::fields::{classify_kind, normalize, EntityClass, IDENTITY_FIELDS};
use crate::strategy::{ConflictContext, StrategyPipeline};
use offsync_protocol::{ConflictType, EntitySnapshot, ResolutionChoice, RiskLevel, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Risk assessment of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    /// Chance of losing data by picking the wrong side.
    pub data_loss: RiskLevel,
    /// Effect on money or stock.
    pub business_impact: RiskLevel,
    /// Effect on people identified by the entity.
    pub user_impact: RiskLevel,
}

/// A resolution proposed by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoResolution {
    /// Name of the strategy that produced it.
    pub strategy: String,
    /// Which side (or a merge) was chosen.
    pub choice: ResolutionChoice,
    /// The document to keep.
    pub data: Value,
}

/// Full analysis of a local/server pair. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictAnalysis {
    /// Per-field differences.
    pub diffs: Vec<FieldDiff>,
    /// Overall severity.
    pub severity: Severity,
    /// Risk assessment.
    pub risk: RiskAssessment,
    /// What a human (or the pipeline) should do.
    pub recommended_action: ResolutionChoice,
    /// The automatic resolution, if a strategy produced one.
    pub auto_resolution: Option<AutoResolution>,
}

impl ConflictAnalysis {
    /// Returns true if the conflict can be closed without a human.
    pub fn is_auto_resolvable(&self) -> bool {
        self.auto_resolution.is_some()
    }
}

/// Decides whether two snapshots of the same entity conflict.
///
/// Only called when a local pending operation touches the entity.
/// - One side deleted, the other not: [`ConflictType::Deletion`]
/// - Both carry versions and they differ: [`ConflictType::Version`]
/// - A version is missing and an identity field differs: [`ConflictType::Data`]
pub fn detect_conflict(local: &EntitySnapshot, server: &EntitySnapshot) -> Option<ConflictType> {
    if local.is_tombstone() != server.is_tombstone() {
        return Some(ConflictType::Deletion);
    }
    if local.is_tombstone() {
        return None;
    }

    match (local.version, server.version) {
        (Some(l), Some(s)) => (l != s).then_some(ConflictType::Version),
        _ => identity_fields_differ(&local.data, &server.data).then_some(ConflictType::Data),
    }
}

fn identity_fields_differ(local: &Value, server: &Value) -> bool {
    let (Some(local), Some(server)) = (local.as_object(), server.as_object()) else {
        return local != server;
    };
    let pick = |doc: &serde_json::Map<String, Value>, wanted: &str| -> Option<Value> {
        doc.iter()
            .find(|(key, _)| normalize(key) == wanted)
            .map(|(_, value)| value.clone())
    };
    IDENTITY_FIELDS
        .iter()
        .any(|field| pick(local, field) != pick(server, field))
}

/// Computes the severity of a set of diffs on `class`.
///
/// Financial documents with any core diff are critical; everything else,
/// financial documents included, follows the general rule.
pub fn severity(class: EntityClass, diffs: &[FieldDiff]) -> Severity {
    let core = diffs.iter().filter(|d| d.is_core()).count();
    if class == EntityClass::FinancialDocument && core > 0 {
        return Severity::Critical;
    }
    if diffs.iter().any(FieldDiff::is_high) || core > 2 {
        Severity::High
    } else if core > 0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Scores the risk of a set of diffs on `class`.
pub fn assess_risk(class: EntityClass, diffs: &[FieldDiff]) -> RiskAssessment {
    let core = diffs.iter().filter(|d| d.is_core()).count();
    let high_core = diffs.iter().filter(|d| d.is_core() && d.is_high()).count();
    let any_high = diffs.iter().any(FieldDiff::is_high);

    let data_loss = if core == 0 {
        RiskLevel::None
    } else if high_core >= 2 {
        RiskLevel::High
    } else if high_core == 1 || core > 2 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let business_impact = match class {
        EntityClass::FinancialDocument if core > 0 => RiskLevel::High,
        EntityClass::Inventory if core > 0 => RiskLevel::Medium,
        _ if any_high => RiskLevel::Low,
        _ => RiskLevel::None,
    };

    let user_impact = match class {
        EntityClass::Identity if high_core > 0 => RiskLevel::High,
        EntityClass::Identity if core > 0 => RiskLevel::Medium,
        _ if core > 0 => RiskLevel::Low,
        _ => RiskLevel::None,
    };

    RiskAssessment {
        data_loss,
        business_impact,
        user_impact,
    }
}

/// Analyzes conflicts and runs the strategy pipeline.
///
/// # Example
///
/// ```rust
/// use offsync_conflict::ConflictAnalyzer;
/// use offsync_protocol::{EntitySnapshot, ResolutionChoice};
/// use chrono::Utc;
/// use serde_json::json;
///
/// let analyzer = ConflictAnalyzer::new();
/// let now = Utc::now();
/// let local = EntitySnapshot::new("ProductVariant", "3", json!({"stockQuantity": 10}), now);
/// let server = EntitySnapshot::new("ProductVariant", "3", json!({"stockQuantity": 7}), now);
///
/// let analysis = analyzer.analyze(&local, &server);
/// let resolved = analysis.auto_resolution.unwrap();
/// assert_eq!(resolved.choice, ResolutionChoice::Merge);
/// assert_eq!(resolved.data["stockQuantity"], 10);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConflictAnalyzer {
    pipeline: StrategyPipeline,
}

impl ConflictAnalyzer {
    /// Creates an analyzer with the built-in strategies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an analyzer over a custom pipeline.
    pub fn with_pipeline(pipeline: StrategyPipeline) -> Self {
        Self { pipeline }
    }

    /// Returns the strategy pipeline.
    pub fn pipeline(&self) -> &StrategyPipeline {
        &self.pipeline
    }

    /// Returns the strategy pipeline for registration.
    pub fn pipeline_mut(&mut self) -> &mut StrategyPipeline {
        &mut self.pipeline
    }

    /// Analyzes a local/server pair of the same entity.
    pub fn analyze(&self, local: &EntitySnapshot, server: &EntitySnapshot) -> ConflictAnalysis {
        let class = classify_kind(&server.kind);
        // A deleted side diffs as an empty document, so every field of the
        // surviving side counts.
        let empty = Value::Object(serde_json::Map::new());
        let side = |snapshot: &EntitySnapshot| {
            if snapshot.is_tombstone() {
                empty.clone()
            } else {
                snapshot.data.clone()
            }
        };
        let diffs = diff_documents(&side(local), &side(server));
        let severity = severity(class, &diffs);
        let risk = assess_risk(class, &diffs);

        let financial_lock =
            class == EntityClass::FinancialDocument && diffs.iter().any(FieldDiff::is_core);

        let auto_resolution = if financial_lock {
            None
        } else {
            let ctx = ConflictContext {
                kind: &server.kind,
                class,
                local,
                server,
                diffs: &diffs,
            };
            self.pipeline.resolve(&ctx)
        };

        let recommended_action = auto_resolution
            .as_ref()
            .map_or(ResolutionChoice::Manual, |resolution| resolution.choice);

        tracing::debug!(
            entity_kind = %server.kind,
            entity_id = %server.id,
            diffs = diffs.len(),
            %severity,
            strategy = auto_resolution.as_ref().map(|r| r.strategy.as_str()),
            "conflict analyzed"
        );

        ConflictAnalysis {
            diffs,
            severity,
            risk,
            recommended_action,
            auto_resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn snap(kind: &str, data: Value, version: Option<u64>) -> EntitySnapshot {
        let snapshot = EntitySnapshot::new(kind, "1", data, Utc::now());
        match version {
            Some(v) => snapshot.with_version(v),
            None => snapshot,
        }
    }

    #[test]
    fn version_mismatch_is_a_conflict() {
        let local = snap("Customer", json!({"name": "Ada"}), Some(1));
        let server = snap("Customer", json!({"name": "Ada"}), Some(2));
        assert_eq!(detect_conflict(&local, &server), Some(ConflictType::Version));

        let same = snap("Customer", json!({"name": "Bea"}), Some(1));
        assert_eq!(detect_conflict(&local, &same), None);
    }

    #[test]
    fn version_only_conflict_settles_on_the_server_side() {
        let analyzer = ConflictAnalyzer::new();
        for kind in ["Customer", "Invoice", "ProductVariant"] {
            let local = snap(kind, json!({"name": "Ada", "tags": [1, 1]}), Some(1));
            let server = snap(kind, json!({"name": "Ada", "tags": [1, 1]}), Some(2));

            let analysis = analyzer.analyze(&local, &server);
            assert!(analysis.diffs.is_empty());
            assert_eq!(analysis.severity, Severity::Low);
            assert_eq!(
                analysis.risk,
                RiskAssessment {
                    data_loss: RiskLevel::None,
                    business_impact: RiskLevel::None,
                    user_impact: RiskLevel::None,
                }
            );
            let resolved = analysis.auto_resolution.unwrap();
            assert_eq!(resolved.strategy, "metadata_only");
            assert_eq!(resolved.choice, ResolutionChoice::Server);
            assert_eq!(resolved.data, server.data);
        }
    }

    #[test]
    fn duplicate_only_array_change_is_a_diff() {
        let analyzer = ConflictAnalyzer::new();
        let local = snap("Note", json!({"tags": ["a", "a"]}), Some(1));
        let server = snap("Note", json!({"tags": ["a"]}), Some(2));

        let analysis = analyzer.analyze(&local, &server);
        assert_eq!(analysis.diffs.len(), 1);
        assert_eq!(analysis.diffs[0].kind, crate::DiffKind::ArrayItemRemoved);
    }

    #[test]
    fn versionless_detection_uses_identity_fields() {
        let local = snap("Note", json!({"title": "A", "body": "x"}), None);
        let body_only = snap("Note", json!({"title": "A", "body": "y"}), None);
        let retitled = snap("Note", json!({"Title": "B", "body": "x"}), None);

        assert_eq!(detect_conflict(&local, &body_only), None);
        assert_eq!(detect_conflict(&local, &retitled), Some(ConflictType::Data));
    }

    #[test]
    fn deletion_against_edit_is_a_conflict() {
        let local = snap("Customer", json!({"name": "Ada"}), Some(1));
        let deleted = snap("Customer", Value::Null, Some(2));
        assert_eq!(detect_conflict(&local, &deleted), Some(ConflictType::Deletion));
        assert_eq!(detect_conflict(&deleted, &deleted), None);
    }

    #[test]
    fn customer_email_needs_a_human() {
        let analyzer = ConflictAnalyzer::new();
        let local = snap("Customer", json!({"name": "Ada", "email": "a@x.com"}), Some(1));
        let server = snap("Customer", json!({"name": "Ada", "email": "b@x.com"}), Some(2));

        let analysis = analyzer.analyze(&local, &server);
        assert!(analysis.severity >= Severity::Medium);
        assert_eq!(analysis.recommended_action, ResolutionChoice::Manual);
        assert!(analysis.auto_resolution.is_none());
        assert_eq!(analysis.risk.user_impact, RiskLevel::High);
    }

    #[test]
    fn financial_core_diff_is_critical_and_manual() {
        let analyzer = ConflictAnalyzer::new();
        let local = snap("Invoice", json!({"total": 100, "notes": "a"}), Some(1));
        let server = snap("Invoice", json!({"total": 100, "notes": "b"}), Some(2));

        let analysis = analyzer.analyze(&local, &server);
        assert_eq!(analysis.severity, Severity::Critical);
        assert_eq!(analysis.recommended_action, ResolutionChoice::Manual);
        assert_eq!(analysis.risk.business_impact, RiskLevel::High);
    }

    #[test]
    fn stock_conflict_takes_the_larger_value() {
        let analyzer = ConflictAnalyzer::new();
        let local = snap("ProductVariant", json!({"sku": "V3", "stockQuantity": 10}), Some(4));
        let server = snap("ProductVariant", json!({"sku": "V3", "stockQuantity": 7}), Some(5));

        let analysis = analyzer.analyze(&local, &server);
        let resolution = analysis.auto_resolution.unwrap();
        assert_eq!(resolution.strategy, "quantity_merge");
        assert_eq!(resolution.data["stockQuantity"], 10);
        assert_eq!(analysis.risk.business_impact, RiskLevel::Medium);
    }

    #[test]
    fn deletion_of_customer_is_not_auto_resolved() {
        let analyzer = ConflictAnalyzer::new();
        let local = snap("Customer", json!({"name": "Ada", "email": "a@x.com"}), Some(1));
        let server = snap("Customer", Value::Null, Some(2));

        let analysis = analyzer.analyze(&local, &server);
        assert!(analysis.diffs.iter().all(|d| d.kind == crate::DiffKind::FieldRemoved));
        assert_eq!(analysis.recommended_action, ResolutionChoice::Manual);
    }

    #[test]
    fn risk_grades_data_loss() {
        let few = diff_documents(&json!({"name": "a"}), &json!({"name": "b"}));
        assert_eq!(assess_risk(EntityClass::General, &few).data_loss, RiskLevel::Low);

        let two_high = diff_documents(
            &json!({"price": 1, "quantity": 1}),
            &json!({"price": 2, "quantity": 2}),
        );
        assert_eq!(assess_risk(EntityClass::General, &two_high).data_loss, RiskLevel::High);
        assert_eq!(severity(EntityClass::General, &two_high), Severity::High);

        assert_eq!(assess_risk(EntityClass::General, &[]).data_loss, RiskLevel::None);
    }

    fn metadata_doc() -> impl Strategy<Value = Value> {
        (0i64..1000, "[a-z]{0,8}", 0u32..50).prop_map(|(updated, etag, revision)| {
            json!({
                "updatedAt": updated,
                "etag": etag,
                "revision": revision,
                "name": "fixed",
                "price": 12,
            })
        })
    }

    proptest! {
        #[test]
        fn metadata_only_differences_are_low_and_auto_resolved(
            local in metadata_doc(),
            server in metadata_doc(),
            kind in "(Customer|Invoice|ProductVariant|Note|SalesOrder)",
            skew in -5i64..5,
        ) {
            let analyzer = ConflictAnalyzer::new();
            let now = Utc::now();
            let local = EntitySnapshot::new(kind.clone(), "1", local, now + Duration::seconds(skew))
                .with_version(1);
            let server = EntitySnapshot::new(kind, "1", server, now).with_version(2);

            let analysis = analyzer.analyze(&local, &server);
            prop_assert_eq!(analysis.severity, Severity::Low);
            prop_assert!(analysis.auto_resolution.is_some());
        }
    }
}
