//! Protocol messages for reconciliation, device management and push.
//!
//! All messages travel as camelCase JSON.

use crate::entity::{EntityKey, EntitySnapshot};
use crate::operation::OperationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entity change as exchanged with the reconciliation endpoint.
///
/// Used for both directions: `uploadChanges` in a request and
/// `downloadChanges` in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    /// Entity kind.
    pub entity_kind: String,
    /// Create, update or delete.
    pub operation: OperationType,
    /// Entity id.
    pub id: String,
    /// Entity document (`null` for deletes).
    #[serde(default)]
    pub data: Value,
    /// When the change was made.
    pub timestamp: DateTime<Utc>,
    /// Version the change carries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl RemoteChange {
    /// Returns the key of the changed entity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_kind.clone(), self.id.clone())
    }

    /// Returns true if the change removes the entity.
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Materializes the change as a snapshot.
    ///
    /// Deletes become tombstones (`data == null`).
    pub fn to_snapshot(&self) -> EntitySnapshot {
        let data = if self.is_delete() {
            Value::Null
        } else {
            self.data.clone()
        };
        EntitySnapshot {
            id: self.id.clone(),
            kind: self.entity_kind.clone(),
            data,
            last_modified: self.timestamp,
            version: self.version,
        }
    }
}

/// Request body of the reconciliation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    /// Requesting device.
    pub device_id: String,
    /// Local changes to upload.
    pub upload_changes: Vec<RemoteChange>,
    /// Server timestamp of the previous successful pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Entity kinds the device wants to receive.
    pub entities: Vec<String>,
}

/// Per-change acknowledgement of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    /// Entity kind.
    pub entity_kind: String,
    /// Entity id.
    pub id: String,
    /// Whether the server applied the change.
    pub accepted: bool,
    /// Version assigned by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadAck {
    /// Creates an accepted acknowledgement.
    pub fn accepted(key: &EntityKey, version: Option<u64>) -> Self {
        Self {
            entity_kind: key.kind.clone(),
            id: key.id.clone(),
            accepted: true,
            version,
            error: None,
        }
    }

    /// Creates a rejection.
    pub fn rejected(key: &EntityKey, error: impl Into<String>) -> Self {
        Self {
            entity_kind: key.kind.clone(),
            id: key.id.clone(),
            accepted: false,
            version: None,
            error: Some(error.into()),
        }
    }

    /// Returns the key of the acknowledged entity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_kind.clone(), self.id.clone())
    }
}

/// Response body of the reconciliation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    /// Server id of the accepted upload batch.
    pub upload_batch_id: String,
    /// Server changes since `lastSyncTime`.
    #[serde(default)]
    pub download_changes: Vec<RemoteChange>,
    /// Server time of this pass; becomes the next `lastSyncTime`.
    pub timestamp: DateTime<Utc>,
    /// Per-change outcome. Absent means every upload was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledgements: Option<Vec<UploadAck>>,
}

/// Per-device sync settings served by the device endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    /// Device id.
    pub device_id: String,
    /// Whether sync runs at all.
    pub sync_enabled: bool,
    /// Interval of the periodic sync timer.
    pub sync_interval_seconds: u64,
    /// Maximum operations uploaded per pass.
    pub max_batch_size: usize,
    /// Kinds to sync. Empty means every kind.
    pub supported_entity_kinds: Vec<String>,
    /// After this long without a successful sync the device is stale.
    pub offline_timeout_hours: u64,
}

impl DeviceConfig {
    /// Built-in defaults for `device_id`.
    pub fn defaults_for(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    /// Returns true if `kind` should be synced.
    pub fn supports(&self, kind: &str) -> bool {
        self.supported_entity_kinds.is_empty()
            || self.supported_entity_kinds.iter().any(|k| k == kind)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            sync_enabled: true,
            sync_interval_seconds: 300,
            max_batch_size: 50,
            supported_entity_kinds: Vec::new(),
            offline_timeout_hours: 72,
        }
    }
}

/// Request body of the device registration endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Device id.
    pub device_id: String,
    /// Owning user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Client platform description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Client version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// Identity presented when opening the push channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushIdentity {
    /// Bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// User id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Optional scope (e.g. a store or tenant).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A server-originated change delivered over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushUpdate {
    /// Entity kind.
    pub entity_kind: String,
    /// Entity id; falls back to `data.id` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Entity document (`null` when the entity was deleted).
    #[serde(default)]
    pub data: Value,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
    /// User who made the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,
}

impl PushUpdate {
    /// Returns the entity id, reading `data.id` if needed.
    pub fn resolved_id(&self) -> Option<String> {
        if let Some(id) = &self.entity_id {
            return Some(id.clone());
        }
        match self.data.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Converts the update into the same shape as a downloaded change.
    ///
    /// Returns `None` when no entity id can be determined.
    pub fn to_remote_change(&self) -> Option<RemoteChange> {
        let id = self.resolved_id()?;
        let operation = if self.data.is_null() {
            OperationType::Delete
        } else {
            OperationType::Update
        };
        Some(RemoteChange {
            entity_kind: self.entity_kind.clone(),
            operation,
            id,
            data: self.data.clone(),
            timestamp: self.timestamp,
            version: self.data.get("version").and_then(Value::as_u64),
        })
    }
}

/// Frames sent by the client over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Start receiving updates for a kind, or one entity of it.
    Subscribe {
        /// Entity kind.
        entity_kind: String,
        /// Entity id; `None` subscribes to the whole kind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
    },
    /// Stop receiving updates.
    Unsubscribe {
        /// Entity kind.
        entity_kind: String,
        /// Entity id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
    },
    /// Keep-alive.
    Ping,
}

/// Frames sent by the server over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// A single entity changed.
    EntityUpdate(PushUpdate),
    /// Initial state burst sent right after connecting.
    Snapshot {
        /// Current entity states.
        changes: Vec<RemoteChange>,
    },
    /// Backlog of recent changes sent right after connecting.
    RecentChanges {
        /// Recent changes, oldest first.
        changes: Vec<RemoteChange>,
    },
    /// Keep-alive answer.
    Pong,
    /// Server-side error report.
    Error {
        /// Error message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reconcile_request_wire_shape() {
        let request = ReconcileRequest {
            device_id: "dev-1".into(),
            upload_changes: vec![RemoteChange {
                entity_kind: "Customer".into(),
                operation: OperationType::Create,
                id: "1".into(),
                data: json!({"name": "Ada"}),
                timestamp: Utc::now(),
                version: None,
            }],
            last_sync_time: None,
            entities: vec!["Customer".into()],
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["deviceId"], "dev-1");
        assert_eq!(value["uploadChanges"][0]["operation"], "create");
        assert_eq!(value["uploadChanges"][0]["entityKind"], "Customer");
        assert!(value.get("lastSyncTime").is_none());
    }

    #[test]
    fn response_without_acknowledgements() {
        let body = json!({
            "uploadBatchId": "b-1",
            "downloadChanges": [],
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let response: ReconcileResponse = serde_json::from_value(body).unwrap();
        assert!(response.acknowledgements.is_none());
        assert_eq!(response.upload_batch_id, "b-1");
    }

    #[test]
    fn device_config_defaults_fill_missing_fields() {
        let config: DeviceConfig =
            serde_json::from_value(json!({"deviceId": "d", "maxBatchSize": 10})).unwrap();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.sync_interval_seconds, 300);
        assert!(config.sync_enabled);
        assert!(config.supports("Anything"));
    }

    #[test]
    fn push_update_falls_back_to_data_id() {
        let update = PushUpdate {
            entity_kind: "Product".into(),
            entity_id: None,
            data: json!({"id": 17, "version": 4}),
            timestamp: Utc::now(),
            source_user_id: None,
        };
        let change = update.to_remote_change().unwrap();
        assert_eq!(change.id, "17");
        assert_eq!(change.version, Some(4));
        assert_eq!(change.operation, OperationType::Update);

        let orphan = PushUpdate {
            data: json!({"name": "no id"}),
            ..update
        };
        assert!(orphan.to_remote_change().is_none());
    }

    #[test]
    fn frames_are_tagged() {
        let frame = ClientFrame::Subscribe {
            entity_kind: "Customer".into(),
            entity_id: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "subscribe", "entityKind": "Customer"}));

        let inbound: ServerFrame = serde_json::from_value(json!({
            "type": "entity_update",
            "entityKind": "Customer",
            "entityId": "9",
            "data": {"name": "Grace"},
            "timestamp": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert!(matches!(inbound, ServerFrame::EntityUpdate(ref u) if u.entity_id.as_deref() == Some("9")));
    }

    #[test]
    fn delete_change_becomes_tombstone() {
        let change = RemoteChange {
            entity_kind: "Customer".into(),
            operation: OperationType::Delete,
            id: "3".into(),
            data: json!({"stale": true}),
            timestamp: Utc::now(),
            version: Some(9),
        };
        let snapshot = change.to_snapshot();
        assert!(snapshot.is_tombstone());
        assert_eq!(snapshot.version, Some(9));
    }
}
