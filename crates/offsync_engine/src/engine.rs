//! The sync engine facade.
//!
//! [`SyncEngine`] is what business code talks to. It owns every component
//! and wires them together:
//!
//! ```text
//!  enqueue ──▶ OperationQueue ──▶ SyncOrchestrator ──▶ SyncTransport
//!                   ▲                   │
//!                   │                   ▼
//!                   └────────── ChangeApplier ◀── RealtimeClient
//!                                       │
//!                                ConflictResolver
//! ```
//!
//! Everything except [`SyncEngine::start`], [`SyncEngine::sync_now`] and
//! [`SyncEngine::shutdown`] works without a network connection.

use crate::apply::{ChangeApplier, ChangeSource};
use crate::config::EngineConfig;
use crate::device::{ConfigSource, DeviceManager};
use crate::error::{SyncError, SyncResult};
use crate::events::{ListenerRegistry, Subscription, SyncEvent};
use crate::http::HttpTransport;
use crate::orchestrator::{SyncOrchestrator, SyncReport, SyncStats};
use crate::queue::{OperationQueue, QueueItem, QueueStats};
use crate::realtime::{ConnectionStatus, PushConnector, PushHandler, RealtimeClient};
use crate::transport::SyncTransport;
use crate::ws::WsConnector;
use chrono::{DateTime, Utc};
use offsync_conflict::{ConflictResolver, ManualResolution, StrategyStats};
use offsync_protocol::{
    Clock, Conflict, ConflictId, DeviceConfig, DeviceRegistration, EntityKey, EntitySnapshot,
    NewOperation, OperationType, PushIdentity, RemoteChange, ResolutionRecord, SyncOperation,
    SystemClock,
};
use offsync_store::{LocalStore, StoreBatch};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Everything [`SyncEngine::get_stats`] reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Queue counters.
    pub queue: QueueStats,
    /// Lifetime sync counters.
    pub sync: SyncStats,
    /// Last sync time the next pass would send.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Online flag.
    pub online: bool,
    /// Push channel status, if real-time updates are configured.
    pub connection: Option<ConnectionStatus>,
    /// Conflicts waiting for a decision.
    pub open_conflicts: usize,
    /// The last successful sync is older than the offline timeout.
    pub stale: bool,
    /// Where the device settings came from.
    pub device_config_source: ConfigSource,
}

/// Builds a [`SyncEngine`].
///
/// Only the store is required. The transport defaults to
/// [`HttpTransport`] over `reqwest`, the push connector to [`WsConnector`]
/// when a push URL is configured, and the clock to [`SystemClock`].
pub struct EngineBuilder {
    config: EngineConfig,
    store: Arc<dyn LocalStore>,
    transport: Option<Arc<dyn SyncTransport>>,
    connector: Option<Arc<dyn PushConnector>>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    /// Starts a builder over `store`.
    pub fn new(config: EngineConfig, store: Arc<dyn LocalStore>) -> Self {
        Self {
            config,
            store,
            transport: None,
            connector: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses a custom transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses a custom push connector. Enables real-time updates even without
    /// a push URL.
    #[must_use]
    pub fn push_connector(mut self, connector: Arc<dyn PushConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Uses a custom clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wires the engine.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Config`] for invalid URLs or durations
    /// - [`SyncError::Storage`] if the queue or cached settings cannot be read
    pub fn build(self) -> SyncResult<SyncEngine> {
        let Self {
            config,
            store,
            transport,
            connector,
            clock,
        } = self;

        let transport: Arc<dyn SyncTransport> = match transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&config)?),
        };
        let connector: Option<Arc<dyn PushConnector>> = match (connector, &config.push_url) {
            (Some(connector), _) => Some(connector),
            (None, Some(url)) => Some(Arc::new(WsConnector::new(url, config.request_timeout)?)),
            (None, None) => None,
        };

        let retention = chrono::Duration::from_std(config.conflict_retention)
            .map_err(|e| SyncError::Config(format!("invalid conflict retention: {e}")))?;
        let events = ListenerRegistry::new();
        let queue = Arc::new(OperationQueue::open(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.queue_retry.clone(),
        )?);
        let resolver = Arc::new(
            ConflictResolver::new(Arc::clone(&store), Arc::clone(&clock)).with_retention(retention),
        );
        let applier = Arc::new(ChangeApplier::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            resolver,
            Arc::clone(&clock),
            events.clone(),
        ));
        let registration = DeviceRegistration {
            device_id: config.device_id.clone(),
            user_id: config.user_id.clone(),
            platform: Some(std::env::consts::OS.to_string()),
            app_version: config.app_version.clone(),
        };
        let devices = Arc::new(DeviceManager::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            registration,
            config.default_device_config.clone(),
        )?);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config.device_id.clone(),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&applier),
            transport,
            Arc::clone(&devices),
            Arc::clone(&clock),
            config.request_timeout,
            events.clone(),
        ));

        let realtime = connector.map(|connector| {
            let identity = PushIdentity {
                token: config.auth_token.clone(),
                user_id: config.user_id.clone(),
                device_id: Some(config.device_id.clone()),
                scope: None,
            };
            let handler = Arc::new(EnginePushHandler {
                applier: Arc::clone(&applier),
                devices: Arc::clone(&devices),
                orchestrator: Arc::clone(&orchestrator),
            });
            RealtimeClient::new(
                connector,
                identity,
                config.reconnect_retry.clone(),
                handler,
                events.clone(),
            )
        });

        info!(
            device_id = %config.device_id,
            queued = queue.len(),
            realtime = realtime.is_some(),
            "sync engine ready"
        );

        Ok(SyncEngine {
            config,
            store,
            clock,
            queue,
            applier,
            devices,
            orchestrator,
            realtime,
            events,
            background: Mutex::new(None),
        })
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The offline-first sync engine.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    queue: Arc<OperationQueue>,
    applier: Arc<ChangeApplier>,
    devices: Arc<DeviceManager>,
    orchestrator: Arc<SyncOrchestrator>,
    realtime: Option<RealtimeClient>,
    events: ListenerRegistry<SyncEvent>,
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.config.device_id)
            .field("orchestrator", &self.orchestrator)
            .field("realtime", &self.realtime)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Starts building an engine over `store`.
    pub fn builder(config: EngineConfig, store: Arc<dyn LocalStore>) -> EngineBuilder {
        EngineBuilder::new(config, store)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Returns the operation queue.
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Returns the conflict resolver.
    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        self.applier.resolver()
    }

    /// Returns the sync orchestrator.
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Returns the current device settings.
    pub fn device_config(&self) -> DeviceConfig {
        self.devices.config()
    }

    /// Registers the device, connects the push channel and starts the
    /// periodic sync loop. A second call only re-registers.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Storage failures while caching the device settings. An unreachable
    /// server is not an error; the engine starts on fallback settings.
    pub async fn start(&self) -> SyncResult<()> {
        self.devices.register().await?;
        if let Some(realtime) = &self.realtime {
            realtime.connect();
        }

        let mut background = self.background.lock();
        if background.is_none() {
            let (shutdown, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(Arc::clone(&self.orchestrator).run(shutdown_rx));
            *background = Some(Background { shutdown, task });
            info!(device_id = %self.config.device_id, "sync engine started");
        }
        drop(background);

        self.orchestrator.request_sync();
        Ok(())
    }

    /// Stops the sync loop and the push channel.
    ///
    /// A pass in flight finishes first. Queued operations stay durable.
    pub async fn shutdown(&self) {
        let background = self.background.lock().take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            if let Err(err) = background.task.await {
                error!(error = %err, "sync loop ended abnormally");
            }
        }
        if let Some(realtime) = &self.realtime {
            realtime.disconnect().await;
        }
        info!(device_id = %self.config.device_id, "sync engine stopped");
    }

    /// Queues a local mutation and writes its optimistic snapshot in the
    /// same atomic unit.
    ///
    /// Creates and updates store the payload as the new snapshot, keeping
    /// the last known server version; deletes remove the snapshot.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidOperation`] for an empty kind or id, or a
    ///   create/update without a document
    /// - [`SyncError::Storage`] if the write fails; nothing is queued then
    pub fn enqueue(&self, operation: NewOperation) -> SyncResult<SyncOperation> {
        if operation.entity_kind.is_empty() || operation.entity_id.is_empty() {
            return Err(SyncError::InvalidOperation(
                "entity kind and id must not be empty".into(),
            ));
        }
        if operation.op_type != OperationType::Delete && operation.payload.is_null() {
            return Err(SyncError::InvalidOperation(format!(
                "{} of {}/{} requires a document",
                operation.op_type, operation.entity_kind, operation.entity_id
            )));
        }

        let now = self.clock.now();
        let key = EntityKey::new(operation.entity_kind.clone(), operation.entity_id.clone());
        // The stored version is read and rewritten with no apply in between.
        let queued = self.applier.exclusive(|| -> SyncResult<_> {
            let batch = match operation.op_type {
                OperationType::Delete => StoreBatch::new().delete(key),
                OperationType::Create | OperationType::Update => {
                    let version = self
                        .store
                        .get(&key.kind, &key.id)?
                        .and_then(|snapshot| snapshot.version);
                    let mut snapshot =
                        EntitySnapshot::new(key.kind, key.id, operation.payload.clone(), now);
                    snapshot.version = version;
                    StoreBatch::new().put(snapshot)
                }
            };
            self.queue.enqueue_with(operation.into_operation(now), batch)
        })?;
        if self.orchestrator.is_online() {
            self.orchestrator.request_sync();
        }
        Ok(queued)
    }

    /// Runs a sync pass now.
    ///
    /// Skipped (not queued) when offline, disabled or already running.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        self.orchestrator.perform_sync().await
    }

    /// Re-arms operations that exhausted their attempts. Returns how many.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let count = self.queue.retry_failed()?;
        if count > 0 {
            self.orchestrator.request_sync();
        }
        Ok(count)
    }

    /// Sets the online flag. Going online triggers a pass.
    pub fn set_online(&self, online: bool) {
        self.orchestrator.set_online(online);
    }

    /// Returns the online flag.
    pub fn is_online(&self) -> bool {
        self.orchestrator.is_online()
    }

    /// Receives push updates for a kind, or one entity of it.
    ///
    /// A no-op without real-time updates.
    pub fn subscribe(&self, kind: impl Into<String>, id: Option<String>) {
        if let Some(realtime) = &self.realtime {
            realtime.subscribe(kind, id);
        }
    }

    /// Stops push updates for a scope.
    pub fn unsubscribe(&self, kind: impl Into<String>, id: Option<String>) {
        if let Some(realtime) = &self.realtime {
            realtime.unsubscribe(kind, id);
        }
    }

    /// Returns the push channel status, if real-time updates are configured.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.realtime.as_ref().map(RealtimeClient::status)
    }

    /// Collects engine statistics. Never touches the network.
    pub fn get_stats(&self) -> SyncResult<EngineStats> {
        Ok(EngineStats {
            queue: self.queue.stats(),
            sync: self.orchestrator.stats(),
            last_sync_time: self.orchestrator.last_sync_time()?,
            online: self.orchestrator.is_online(),
            connection: self.connection_status(),
            open_conflicts: self.resolver().open_conflicts()?.len(),
            stale: self.orchestrator.is_stale()?,
            device_config_source: self.devices.source(),
        })
    }

    /// Returns the queued operations in delivery order.
    pub fn queued_operations(&self) -> Vec<QueueItem> {
        self.queue.items()
    }

    /// Returns the conflicts waiting for a decision.
    pub fn open_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        Ok(self.resolver().open_conflicts()?)
    }

    /// Returns resolution history, optionally for one kind.
    pub fn conflict_history(&self, kind: Option<&str>) -> SyncResult<Vec<ResolutionRecord>> {
        Ok(self.resolver().history(kind)?)
    }

    /// Returns how often each strategy closed conflicts.
    pub fn strategy_stats(&self, kind: Option<&str>) -> SyncResult<Vec<StrategyStats>> {
        Ok(self.resolver().strategy_stats(kind)?)
    }

    /// Closes a conflict by a human decision.
    ///
    /// The conflict, the resulting snapshot and the queue change are
    /// written as one unit. Unless the server side was chosen the kept
    /// document is uploaded on the next pass.
    ///
    /// # Errors
    ///
    /// [`SyncError::Conflict`] for unknown or closed conflicts and
    /// `merge`/`manual` decisions without data.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: ManualResolution,
    ) -> SyncResult<ResolutionRecord> {
        let resolved = self.applier.exclusive(|| -> SyncResult<_> {
            let resolved = self.resolver().prepare_manual(id, resolution)?;
            let mut batch = StoreBatch::new();
            resolved.stage(&mut batch);
            self.applier.commit_resolution(&resolved.conflict, batch)?;
            Ok(resolved)
        })?;

        info!(
            conflict_id = %id,
            entity_kind = %resolved.conflict.entity_kind,
            entity_id = %resolved.conflict.entity_id,
            choice = %resolved.record.choice,
            "conflict resolved manually"
        );
        self.events
            .emit(&SyncEvent::ConflictResolved(resolved.record.clone()));
        self.orchestrator.request_sync();
        Ok(resolved.record)
    }

    /// Deletes resolved conflicts older than the retention period.
    pub fn prune_conflicts(&self) -> SyncResult<usize> {
        Ok(self.resolver().prune()?)
    }

    /// Fetches fresh device settings, falling back like registration.
    pub async fn refresh_device_config(&self) -> SyncResult<DeviceConfig> {
        self.devices.refresh().await
    }

    /// Pushes new device settings to the server.
    pub async fn update_device_config(&self, config: DeviceConfig) -> SyncResult<DeviceConfig> {
        self.devices.update(config).await
    }

    /// Calls `listener` for every newly detected conflict.
    pub fn on_conflict<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Conflict) + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| {
            if let SyncEvent::ConflictDetected(conflict) = event {
                listener(conflict);
            }
        })
    }

    /// Calls `listener` for every engine event.
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }
}

struct EnginePushHandler {
    applier: Arc<ChangeApplier>,
    devices: Arc<DeviceManager>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl PushHandler for EnginePushHandler {
    fn handle_changes(&self, changes: Vec<RemoteChange>) {
        let config = self.devices.config();
        for change in changes {
            if !config.supports(&change.entity_kind) {
                debug!(entity_kind = %change.entity_kind, "ignoring push update for unsynced kind");
                continue;
            }
            if let Err(err) = self.applier.apply(&change, ChangeSource::Push) {
                error!(
                    error = %err,
                    entity_kind = %change.entity_kind,
                    entity_id = %change.id,
                    "failed to apply push update"
                );
            }
        }
    }

    fn reconnected(&self) {
        self.orchestrator.request_sync();
    }
}
