//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use offsync_protocol::{DeviceConfig, DeviceRegistration, ReconcileRequest, ReconcileResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process servers, mocks for testing).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Runs one reconciliation exchange.
    async fn reconcile(&self, request: &ReconcileRequest) -> SyncResult<ReconcileResponse>;

    /// Registers the device and returns its settings.
    async fn register_device(&self, registration: &DeviceRegistration) -> SyncResult<DeviceConfig>;

    /// Fetches the device settings.
    async fn fetch_device_config(&self, device_id: &str) -> SyncResult<DeviceConfig>;

    /// Stores new device settings and returns what the server kept.
    async fn update_device_config(&self, config: &DeviceConfig) -> SyncResult<DeviceConfig>;
}

/// A scripted transport for testing.
///
/// Reconcile responses are consumed in order; every request is recorded.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    responses: Mutex<VecDeque<SyncResult<ReconcileResponse>>>,
    requests: Mutex<Vec<ReconcileRequest>>,
    device_config: Mutex<Option<DeviceConfig>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            device_config: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    /// Queues the next reconcile response.
    pub fn push_response(&self, response: ReconcileResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a reconcile failure.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Sets the config served by the device endpoints.
    pub fn set_device_config(&self, config: DeviceConfig) {
        *self.device_config.lock() = Some(config);
    }

    /// Delays every reconcile call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Checks if the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns every reconcile request received so far.
    pub fn requests(&self) -> Vec<ReconcileRequest> {
        self.requests.lock().clone()
    }

    fn device_config(&self) -> SyncResult<DeviceConfig> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.device_config
            .lock()
            .clone()
            .ok_or_else(|| SyncError::ServerError("no mock device config set".into()))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn reconcile(&self, request: &ReconcileRequest) -> SyncResult<ReconcileResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.requests.lock().push(request.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol("no mock reconcile response set".into())))
    }

    async fn register_device(&self, _registration: &DeviceRegistration) -> SyncResult<DeviceConfig> {
        self.device_config()
    }

    async fn fetch_device_config(&self, _device_id: &str) -> SyncResult<DeviceConfig> {
        self.device_config()
    }

    async fn update_device_config(&self, config: &DeviceConfig) -> SyncResult<DeviceConfig> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        *self.device_config.lock() = Some(config.clone());
        Ok(config.clone())
    }
}
