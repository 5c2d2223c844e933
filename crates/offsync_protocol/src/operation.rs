//! Sync operations.

use crate::entity::EntityKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Type of sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

impl OperationType {
    /// Queue priority of this type. Lower is dequeued first.
    pub fn priority(&self) -> u8 {
        match self {
            OperationType::Delete => 1,
            OperationType::Create => 2,
            OperationType::Update => 3,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting to be uploaded.
    Pending,
    /// Part of an in-flight sync pass.
    Processing,
    /// Acknowledged by the server.
    Completed,
    /// Exhausted its retries; needs an administrative retry.
    Failed,
}

impl OperationStatus {
    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(format!("unknown operation status: {other}")),
        }
    }
}

/// Unique identifier of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A mutation as handed over by business code, before it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Operation type.
    pub op_type: OperationType,
    /// Entity kind.
    pub entity_kind: String,
    /// Entity id.
    pub entity_id: String,
    /// Full entity document (ignored for deletes).
    pub payload: Value,
}

impl NewOperation {
    /// Creates a create operation.
    pub fn create(kind: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            op_type: OperationType::Create,
            entity_kind: kind.into(),
            entity_id: id.into(),
            payload,
        }
    }

    /// Creates an update operation.
    pub fn update(kind: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            op_type: OperationType::Update,
            entity_kind: kind.into(),
            entity_id: id.into(),
            payload,
        }
    }

    /// Creates a delete operation.
    pub fn delete(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            op_type: OperationType::Delete,
            entity_kind: kind.into(),
            entity_id: id.into(),
            payload: Value::Null,
        }
    }

    /// Turns this into a pending operation created at `now`.
    pub fn into_operation(self, now: DateTime<Utc>) -> SyncOperation {
        SyncOperation {
            id: OperationId::new(),
            op_type: self.op_type,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id,
            payload: self.payload,
            created_at: now,
            retry_count: 0,
            status: OperationStatus::Pending,
            sequence: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }
}

/// A queued local mutation awaiting transmission.
///
/// Operations are created by business code, mutated only by the queue and
/// the orchestrator, and deleted once acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation id.
    pub id: OperationId,
    /// Operation type.
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Entity kind.
    pub entity_kind: String,
    /// Entity id.
    pub entity_id: String,
    /// Entity document.
    pub payload: Value,
    /// When the operation was created.
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Append order assigned by the store.
    #[serde(default)]
    pub sequence: u64,
    /// Earliest time of the next delivery attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Returns the key of the entity this operation touches.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_kind.clone(), self.entity_id.clone())
    }

    /// Returns true if the operation touches `key`.
    pub fn touches(&self, key: &EntityKey) -> bool {
        self.entity_kind == key.kind && self.entity_id == key.id
    }

    /// Applies a patch in place.
    pub fn apply_patch(&mut self, patch: &OperationPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(next_attempt_at) = patch.next_attempt_at {
            self.next_attempt_at = next_attempt_at;
        }
        if let Some(last_error) = &patch.last_error {
            self.last_error = last_error.clone();
        }
        if let Some(payload) = &patch.payload {
            self.payload = payload.clone();
        }
    }
}

/// A partial update of a stored operation.
///
/// `None` leaves a field untouched; the nested options of `next_attempt_at`
/// and `last_error` allow clearing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPatch {
    /// New status.
    pub status: Option<OperationStatus>,
    /// New retry count.
    pub retry_count: Option<u32>,
    /// New next-attempt time.
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    /// New last error.
    pub last_error: Option<Option<String>>,
    /// New payload.
    pub payload: Option<Value>,
}

impl OperationPatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status.
    #[must_use]
    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Sets or clears the next-attempt time.
    #[must_use]
    pub fn next_attempt_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    /// Sets or clears the last error.
    #[must_use]
    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    /// Replaces the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priorities_follow_type() {
        assert!(OperationType::Delete.priority() < OperationType::Create.priority());
        assert!(OperationType::Create.priority() < OperationType::Update.priority());
    }

    #[test]
    fn new_operation_starts_pending() {
        let now = Utc::now();
        let op = NewOperation::create("Customer", "1", json!({"name": "Ada"})).into_operation(now);
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.created_at, now);
        assert!(op.touches(&EntityKey::new("Customer", "1")));
    }

    #[test]
    fn patch_can_clear_fields() {
        let mut op = NewOperation::delete("Customer", "1").into_operation(Utc::now());
        op.last_error = Some("boom".into());
        op.next_attempt_at = Some(Utc::now());

        op.apply_patch(
            &OperationPatch::new()
                .status(OperationStatus::Failed)
                .retry_count(3)
                .last_error(None)
                .next_attempt_at(None),
        );

        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 3);
        assert!(op.last_error.is_none());
        assert!(op.next_attempt_at.is_none());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("FAILED".parse::<OperationStatus>(), Ok(OperationStatus::Failed));
        assert!("bogus".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn operation_serializes_type_field() {
        let op = NewOperation::update("Product", "7", json!({})).into_operation(Utc::now());
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["entityKind"], "Product");
        let back: SyncOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }
}
