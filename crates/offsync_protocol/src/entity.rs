//! Entity identity and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of an entity: its kind plus its id within that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity kind (e.g. `Customer`).
    pub kind: String,
    /// Entity id, unique within the kind.
    pub id: String,
}

impl EntityKey {
    /// Creates a new key.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// The last-known materialized state of one entity.
///
/// A snapshot is always written whole; the store never patches individual
/// fields of `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    /// Entity id.
    pub id: String,
    /// Entity kind.
    pub kind: String,
    /// Opaque JSON document.
    pub data: Value,
    /// When this state was last modified.
    pub last_modified: DateTime<Utc>,
    /// Server-assigned version, if the entity carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl EntitySnapshot {
    /// Creates a snapshot without version metadata.
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        data: Value,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            data,
            last_modified,
            version: None,
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Returns the key of this snapshot.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind.clone(), self.id.clone())
    }

    /// Returns true if this snapshot stands for a deleted entity.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_display() {
        let key = EntityKey::new("Customer", "42");
        assert_eq!(key.to_string(), "Customer#42");
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = EntitySnapshot::new("Customer", "1", json!({"name": "Ada"}), Utc::now())
            .with_version(3);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("lastModified").is_some());
        assert_eq!(value["version"], 3);

        let unversioned = EntitySnapshot::new("Customer", "1", json!({}), Utc::now());
        let value = serde_json::to_value(&unversioned).unwrap();
        assert!(value.get("version").is_none());
    }

    #[test]
    fn tombstone_detection() {
        let snapshot = EntitySnapshot::new("Customer", "1", Value::Null, Utc::now());
        assert!(snapshot.is_tombstone());
    }
}
