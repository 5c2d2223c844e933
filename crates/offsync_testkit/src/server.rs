//! In-memory reconciliation server.
//!
//! Implements [`SyncTransport`] directly so engines can be tested without a
//! network. The server keeps:
//! - The current version and document of every entity
//! - A change log in commit order, tagged with the device that made it
//! - Per-device settings
//!
//! Uploads carrying a version older than the server's are rejected, which
//! is how a client learns that someone else changed the entity first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offsync_engine::{SyncError, SyncResult, SyncTransport};
use offsync_protocol::{
    Clock, DeviceConfig, DeviceRegistration, EntityKey, OperationType, ReconcileRequest,
    ReconcileResponse, RemoteChange, UploadAck,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct EntityState {
    data: Value,
    version: u64,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct LoggedChange {
    change: RemoteChange,
    origin: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    entities: HashMap<EntityKey, EntityState>,
    log: Vec<LoggedChange>,
    devices: HashMap<String, DeviceConfig>,
    registrations: Vec<DeviceRegistration>,
    requests: Vec<ReconcileRequest>,
    failures: VecDeque<SyncError>,
    rejections: VecDeque<String>,
    reachable: bool,
    omit_acknowledgements: bool,
}

/// A reconciliation server living in the test process.
pub struct InMemoryServer {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl std::fmt::Debug for InMemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryServer")
            .field("entities", &state.entities.len())
            .field("log", &state.log.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryServer {
    /// Creates an empty, reachable server.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State {
                reachable: true,
                ..State::default()
            }),
            latency: Mutex::new(None),
        }
    }

    /// Makes every call fail with [`SyncError::NotConnected`] while false.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Fails the next reconcile call with `error`.
    pub fn fail_next(&self, error: SyncError) {
        self.state.lock().failures.push_back(error);
    }

    /// Rejects the next `count` uploaded changes with `reason`.
    pub fn reject_uploads(&self, count: usize, reason: &str) {
        let mut state = self.state.lock();
        state
            .rejections
            .extend(std::iter::repeat(reason.to_string()).take(count));
    }

    /// Delays every reconcile call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Answers like an older server that sends no acknowledgements.
    pub fn omit_acknowledgements(&self, omit: bool) {
        self.state.lock().omit_acknowledgements = omit;
    }

    /// Serves `config` to its device.
    pub fn set_device_config(&self, config: DeviceConfig) {
        self.state
            .lock()
            .devices
            .insert(config.device_id.clone(), config);
    }

    /// Changes an entity on the server side, as another client would.
    ///
    /// Returns the logged change.
    pub fn server_edit(&self, kind: &str, id: &str, data: Value) -> RemoteChange {
        let now = self.clock.now();
        let mut state = self.state.lock();
        commit(&mut state, EntityKey::new(kind, id), data, now, None)
    }

    /// Deletes an entity on the server side.
    pub fn server_delete(&self, kind: &str, id: &str) -> RemoteChange {
        self.server_edit(kind, id, Value::Null)
    }

    /// Returns the server's document and version for an entity.
    pub fn entity(&self, kind: &str, id: &str) -> Option<(Value, u64)> {
        self.state
            .lock()
            .entities
            .get(&EntityKey::new(kind, id))
            .filter(|entity| !entity.deleted)
            .map(|entity| (entity.data.clone(), entity.version))
    }

    /// Returns every reconcile request received so far.
    pub fn requests(&self) -> Vec<ReconcileRequest> {
        self.state.lock().requests.clone()
    }

    /// Returns every device registration received so far.
    pub fn registrations(&self) -> Vec<DeviceRegistration> {
        self.state.lock().registrations.clone()
    }

    /// Returns the number of changes committed.
    pub fn change_count(&self) -> usize {
        self.state.lock().log.len()
    }

    fn check_reachable(&self) -> SyncResult<()> {
        if self.state.lock().reachable {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

fn commit(
    state: &mut State,
    key: EntityKey,
    data: Value,
    at: DateTime<Utc>,
    origin: Option<String>,
) -> RemoteChange {
    let deleted = data.is_null();
    let entity = state.entities.entry(key.clone()).or_insert(EntityState {
        data: Value::Null,
        version: 0,
        deleted: true,
    });
    let operation = match (deleted, entity.deleted) {
        (true, _) => OperationType::Delete,
        (false, true) => OperationType::Create,
        (false, false) => OperationType::Update,
    };
    entity.version += 1;
    entity.deleted = deleted;
    entity.data = data.clone();

    let change = RemoteChange {
        entity_kind: key.kind,
        operation,
        id: key.id,
        data,
        timestamp: at,
        version: Some(entity.version),
    };
    state.log.push(LoggedChange {
        change: change.clone(),
        origin,
    });
    change
}

#[async_trait]
impl SyncTransport for InMemoryServer {
    async fn reconcile(&self, request: &ReconcileRequest) -> SyncResult<ReconcileResponse> {
        self.check_reachable()?;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let now = self.clock.now();
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let mut acks = Vec::with_capacity(request.upload_changes.len());
        for upload in &request.upload_changes {
            let key = upload.key();
            let current = state
                .entities
                .get(&key)
                .filter(|entity| !entity.deleted)
                .map(|entity| entity.version);
            if let Some(reason) = state.rejections.pop_front() {
                acks.push(UploadAck::rejected(&key, reason));
                continue;
            }
            match (upload.version, current) {
                (Some(base), Some(current)) if base < current => {
                    acks.push(UploadAck::rejected(
                        &key,
                        format!("version conflict: client has {base}, server has {current}"),
                    ));
                }
                _ => {
                    let data = if upload.is_delete() {
                        Value::Null
                    } else {
                        upload.data.clone()
                    };
                    let change = commit(&mut state, key.clone(), data, now, Some(request.device_id.clone()));
                    acks.push(UploadAck::accepted(&key, change.version));
                }
            }
        }

        let download_changes = state
            .log
            .iter()
            .filter(|logged| logged.origin.as_deref() != Some(request.device_id.as_str()))
            .filter(|logged| request.last_sync_time.map_or(true, |since| logged.change.timestamp >= since))
            .filter(|logged| {
                request.entities.is_empty() || request.entities.contains(&logged.change.entity_kind)
            })
            .map(|logged| logged.change.clone())
            .collect();

        Ok(ReconcileResponse {
            upload_batch_id: uuid::Uuid::new_v4().to_string(),
            download_changes,
            timestamp: now,
            acknowledgements: (!state.omit_acknowledgements).then_some(acks),
        })
    }

    async fn register_device(&self, registration: &DeviceRegistration) -> SyncResult<DeviceConfig> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.registrations.push(registration.clone());
        Ok(state
            .devices
            .entry(registration.device_id.clone())
            .or_insert_with(|| DeviceConfig::defaults_for(registration.device_id.clone()))
            .clone())
    }

    async fn fetch_device_config(&self, device_id: &str) -> SyncResult<DeviceConfig> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .devices
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| DeviceConfig::defaults_for(device_id)))
    }

    async fn update_device_config(&self, config: &DeviceConfig) -> SyncResult<DeviceConfig> {
        self.check_reachable()?;
        self.set_device_config(config.clone());
        Ok(config.clone())
    }
}
