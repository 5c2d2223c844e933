//! Device registration and configuration.
//!
//! The server owns device settings. When it cannot be reached the last
//! settings it served are used, and failing that the built-in defaults.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use offsync_protocol::{DeviceConfig, DeviceRegistration};
use offsync_store::LocalStore;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Metadata key of the cached device settings.
pub const DEVICE_CONFIG_META_KEY: &str = "device_config";

/// Where the current device settings came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Fetched from the server during this session.
    Server,
    /// The copy cached from an earlier session.
    Cached,
    /// Built-in defaults.
    Defaults,
}

/// Holds the device's registration and current settings.
pub struct DeviceManager {
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn LocalStore>,
    registration: DeviceRegistration,
    defaults: DeviceConfig,
    current: RwLock<(DeviceConfig, ConfigSource)>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("registration", &self.registration)
            .field("current", &*self.current.read())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Creates a manager, starting from the cached settings if any.
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn LocalStore>,
        registration: DeviceRegistration,
        defaults: DeviceConfig,
    ) -> SyncResult<Self> {
        let current = match load_cached(store.as_ref())? {
            Some(cached) => (cached, ConfigSource::Cached),
            None => (defaults.clone(), ConfigSource::Defaults),
        };
        Ok(Self {
            transport,
            store,
            registration,
            defaults,
            current: RwLock::new(current),
        })
    }

    /// Returns the current settings.
    pub fn config(&self) -> DeviceConfig {
        self.current.read().0.clone()
    }

    /// Returns where the current settings came from.
    pub fn source(&self) -> ConfigSource {
        self.current.read().1
    }

    /// Registers the device and adopts the settings the server returns.
    ///
    /// Transport failures fall back to cached or default settings;
    /// storage failures are returned.
    pub async fn register(&self) -> SyncResult<DeviceConfig> {
        let result = self.transport.register_device(&self.registration).await;
        self.adopt_or_fall_back(result, "device registration")
    }

    /// Refreshes the settings from the server.
    ///
    /// Falls back like [`Self::register`].
    pub async fn refresh(&self) -> SyncResult<DeviceConfig> {
        let result = self
            .transport
            .fetch_device_config(&self.registration.device_id)
            .await;
        self.adopt_or_fall_back(result, "device config fetch")
    }

    /// Pushes new settings to the server and adopts what it kept.
    ///
    /// Unlike [`Self::refresh`] every failure is returned.
    pub async fn update(&self, config: DeviceConfig) -> SyncResult<DeviceConfig> {
        if config.device_id != self.registration.device_id {
            return Err(SyncError::InvalidOperation(format!(
                "config for device {} cannot be applied to {}",
                config.device_id, self.registration.device_id
            )));
        }
        let kept = self.transport.update_device_config(&config).await?;
        self.adopt(kept)
    }

    fn adopt_or_fall_back(
        &self,
        result: SyncResult<DeviceConfig>,
        what: &str,
    ) -> SyncResult<DeviceConfig> {
        match result {
            Ok(config) => self.adopt(config),
            Err(err) if err.is_transport() => {
                let (config, source) = match load_cached(self.store.as_ref())? {
                    Some(cached) => (cached, ConfigSource::Cached),
                    None => (self.defaults.clone(), ConfigSource::Defaults),
                };
                warn!(error = %err, ?source, "{what} failed, using fallback device config");
                *self.current.write() = (config.clone(), source);
                Ok(config)
            }
            Err(err) => Err(err),
        }
    }

    fn adopt(&self, mut config: DeviceConfig) -> SyncResult<DeviceConfig> {
        if config.device_id.is_empty() {
            config.device_id = self.registration.device_id.clone();
        }
        let value = serde_json::to_value(&config)
            .map_err(|e| SyncError::Protocol(format!("failed to encode device config: {e}")))?;
        self.store.set_meta(DEVICE_CONFIG_META_KEY, value)?;
        info!(
            device_id = %config.device_id,
            sync_enabled = config.sync_enabled,
            interval_seconds = config.sync_interval_seconds,
            "device config updated"
        );
        *self.current.write() = (config.clone(), ConfigSource::Server);
        Ok(config)
    }
}

fn load_cached(store: &dyn LocalStore) -> SyncResult<Option<DeviceConfig>> {
    let Some(value) = store.get_meta(DEVICE_CONFIG_META_KEY)? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(config) => Ok(Some(config)),
        Err(err) => {
            warn!(error = %err, "ignoring unreadable cached device config");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use offsync_store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn registration() -> DeviceRegistration {
        DeviceRegistration {
            device_id: "pos-1".into(),
            user_id: Some("u-1".into()),
            platform: None,
            app_version: None,
        }
    }

    fn manager(transport: Arc<MockTransport>, store: Arc<MemoryStore>) -> DeviceManager {
        DeviceManager::new(
            transport,
            store,
            registration(),
            DeviceConfig::defaults_for("pos-1"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn registration_adopts_and_caches_server_config() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let mut served = DeviceConfig::defaults_for("pos-1");
        served.sync_interval_seconds = 60;
        transport.set_device_config(served.clone());

        let devices = manager(transport, store.clone());
        assert_eq!(devices.source(), ConfigSource::Defaults);

        assert_eq!(devices.register().await.unwrap(), served);
        assert_eq!(devices.source(), ConfigSource::Server);
        assert!(store.get_meta(DEVICE_CONFIG_META_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn offline_falls_back_to_cache_then_defaults() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.set_connected(false);

        let devices = manager(transport.clone(), store.clone());
        let config = devices.refresh().await.unwrap();
        assert_eq!(config, DeviceConfig::defaults_for("pos-1"));
        assert_eq!(devices.source(), ConfigSource::Defaults);

        let mut served = DeviceConfig::defaults_for("pos-1");
        served.max_batch_size = 10;
        transport.set_connected(true);
        transport.set_device_config(served.clone());
        devices.refresh().await.unwrap();

        // A new session that cannot reach the server keeps the cached copy
        transport.set_connected(false);
        let restarted = manager(transport, store);
        assert_eq!(restarted.source(), ConfigSource::Cached);
        assert_eq!(restarted.refresh().await.unwrap(), served);
    }

    #[tokio::test]
    async fn storage_failure_is_returned() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.set_device_config(DeviceConfig::defaults_for("pos-1"));
        let devices = manager(transport, store.clone());

        store.fail_writes(true);
        assert!(matches!(devices.register().await, Err(SyncError::Storage(_))));
    }

    #[tokio::test]
    async fn update_rejects_foreign_device() {
        let transport = Arc::new(MockTransport::new());
        let devices = manager(transport, Arc::new(MemoryStore::new()));
        let result = devices.update(DeviceConfig::defaults_for("other")).await;
        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    }
}
