//! Conflict records and resolution history.

use crate::entity::{EntityKey, EntitySnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Generates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What kind of disagreement was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// Both sides carry versions and they differ.
    Version,
    /// No version metadata; identity fields differ.
    Data,
    /// One side deleted the entity, the other changed it.
    Deletion,
}

/// How a conflict was (or should be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionChoice {
    /// Keep the local version.
    Local,
    /// Accept the server version.
    Server,
    /// Combine both versions.
    Merge,
    /// A human supplied the final document.
    Manual,
}

impl ResolutionChoice {
    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionChoice::Local => "local",
            ResolutionChoice::Server => "server",
            ResolutionChoice::Merge => "merge",
            ResolutionChoice::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall severity of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic differences.
    Low,
    /// Core data differs.
    Medium,
    /// Significant data differs.
    High,
    /// Financial documents with core differences.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A graded risk level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No risk.
    None,
    /// Low risk.
    Low,
    /// Medium risk.
    Medium,
    /// High risk.
    High,
}

/// A detected disagreement between a local and a server snapshot.
///
/// Once `resolved` is set the resolution fields are final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Conflict id.
    pub id: ConflictId,
    /// Entity kind.
    pub entity_kind: String,
    /// Entity id.
    pub entity_id: String,
    /// Local side at detection time.
    pub local_version: EntitySnapshot,
    /// Server side (the most recent one seen while the conflict is open).
    pub server_version: EntitySnapshot,
    /// Kind of disagreement.
    pub conflict_type: ConflictType,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// Whether the conflict is closed.
    pub resolved: bool,
    /// How it was closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionChoice>,
    /// The document that was kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Value>,
    /// When it was closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Strategy name, or `manual`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Free-form notes from a manual decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Conflict {
    /// Opens a new unresolved conflict.
    pub fn open(
        local_version: EntitySnapshot,
        server_version: EntitySnapshot,
        conflict_type: ConflictType,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            entity_kind: server_version.kind.clone(),
            entity_id: server_version.id.clone(),
            local_version,
            server_version,
            conflict_type,
            detected_at,
            resolved: false,
            resolution: None,
            resolved_data: None,
            resolved_at: None,
            resolved_by: None,
            notes: None,
        }
    }

    /// Returns the key of the conflicting entity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_kind.clone(), self.entity_id.clone())
    }

    /// Returns true if the conflict is still waiting for a decision.
    pub fn is_open(&self) -> bool {
        !self.resolved
    }
}

/// An immutable entry of the per-kind resolution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecord {
    /// The resolved conflict.
    pub conflict_id: ConflictId,
    /// Entity kind.
    pub entity_kind: String,
    /// Entity id.
    pub entity_id: String,
    /// The choice that was applied.
    pub choice: ResolutionChoice,
    /// Strategy that produced it, if automatic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// Whether no human was involved.
    pub automatic: bool,
    /// Severity at resolution time.
    pub severity: Severity,
    /// When it was resolved.
    pub resolved_at: DateTime<Utc>,
    /// Notes from a manual decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_conflict_takes_identity_from_server_side() {
        let now = Utc::now();
        let local = EntitySnapshot::new("Customer", "2", json!({"email": "a@x.com"}), now);
        let server = EntitySnapshot::new("Customer", "2", json!({"email": "b@x.com"}), now);

        let conflict = Conflict::open(local, server, ConflictType::Data, now);
        assert!(conflict.is_open());
        assert_eq!(conflict.key(), EntityKey::new("Customer", "2"));
    }

    #[test]
    fn severity_orders_by_gravity() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert!(RiskLevel::None < RiskLevel::High);
    }
}
