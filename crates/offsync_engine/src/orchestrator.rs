//! Sync orchestrator.
//!
//! A sync pass runs the bidirectional reconciliation protocol once:
//!
//! 1. Take the next due batch from the queue, skipping entities with an
//!    open conflict
//! 2. Fold it into one effective change per entity; changes that cancel
//!    out are acknowledged locally
//! 3. Mark the uploads processing and send them with the last sync time,
//!    bounded by the request timeout
//! 4. Settle every upload from the acknowledgements
//! 5. Route downloaded changes through the [`ChangeApplier`]
//! 6. Store the server timestamp as the new last sync time
//!
//! A transport failure returns the uploads to pending without spending an
//! attempt and ends the pass without advancing the last sync time. Only
//! rejections by the server count toward an operation's attempts. Storage
//! failures are returned as errors.
//!
//! Only one pass runs at a time per orchestrator. Triggers that arrive
//! while a pass is running are skipped, not queued.

use crate::apply::{ApplyOutcome, ChangeApplier, ChangeSource};
use crate::device::DeviceManager;
use crate::error::{SyncError, SyncResult};
use crate::events::{ListenerRegistry, SyncEvent};
use crate::queue::{EffectiveChange, OperationQueue};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use offsync_protocol::{
    Clock, DeviceConfig, EntityKey, ReconcileRequest, RemoteChange, UploadAck,
};
use offsync_store::LocalStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Last-sync key used when the device syncs every kind.
pub const ALL_KINDS: &str = "*";

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The device is offline.
    Offline,
    /// Another pass is in flight.
    AlreadyRunning,
    /// Sync is disabled in the device config.
    Disabled,
}

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// The pass reached the server and settled everything.
    pub success: bool,
    /// Set when the pass did not run.
    pub skipped: Option<SkipReason>,
    /// Changes the server accepted.
    pub uploaded: usize,
    /// Changes that cancelled out locally.
    pub cancelled: usize,
    /// Changes the server rejected.
    pub rejected: usize,
    /// Changes held back by an open conflict.
    pub held_back: usize,
    /// Downloaded changes written locally.
    pub downloaded: usize,
    /// Conflicts left open for a decision.
    pub conflicts: usize,
    /// Conflicts closed by a strategy.
    pub auto_resolved: usize,
    /// Server time of this pass.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Why the pass failed.
    pub error: Option<String>,
}

impl SyncReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// Lifetime sync counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Passes that ran.
    pub passes: u64,
    /// Passes that completed.
    pub successful_passes: u64,
    /// Passes that ended on a transport or storage failure.
    pub failed_passes: u64,
    /// Triggers that were skipped.
    pub skipped_passes: u64,
    /// Changes uploaded and accepted.
    pub uploaded: u64,
    /// Downloaded changes written locally.
    pub downloaded: u64,
    /// Conflicts opened.
    pub conflicts: u64,
    /// Conflicts closed by a strategy.
    pub auto_resolved: u64,
    /// When the last pass completed.
    pub last_success: Option<DateTime<Utc>>,
    /// Why the last failed pass failed.
    pub last_error: Option<String>,
}

impl SyncStats {
    fn record(&mut self, report: &SyncReport, now: DateTime<Utc>) {
        if report.skipped.is_some() {
            self.skipped_passes += 1;
            return;
        }
        self.passes += 1;
        self.uploaded += report.uploaded as u64;
        self.downloaded += report.downloaded as u64;
        self.conflicts += report.conflicts as u64;
        self.auto_resolved += report.auto_resolved as u64;
        if report.success {
            self.successful_passes += 1;
            self.last_success = Some(now);
        } else {
            self.failed_passes += 1;
            self.last_error = report.error.clone();
        }
    }
}

/// Releases the single-pass flag when dropped.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs sync passes and owns the single-pass guard.
pub struct SyncOrchestrator {
    device_id: String,
    store: Arc<dyn LocalStore>,
    queue: Arc<OperationQueue>,
    applier: Arc<ChangeApplier>,
    transport: Arc<dyn SyncTransport>,
    devices: Arc<DeviceManager>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    online: AtomicBool,
    running: AtomicBool,
    trigger: Notify,
    stats: Mutex<SyncStats>,
    events: ListenerRegistry<SyncEvent>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("device_id", &self.device_id)
            .field("online", &self.is_online())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Creates an orchestrator. It starts online.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: impl Into<String>,
        store: Arc<dyn LocalStore>,
        queue: Arc<OperationQueue>,
        applier: Arc<ChangeApplier>,
        transport: Arc<dyn SyncTransport>,
        devices: Arc<DeviceManager>,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
        events: ListenerRegistry<SyncEvent>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            queue,
            applier,
            transport,
            devices,
            clock,
            request_timeout,
            online: AtomicBool::new(true),
            running: AtomicBool::new(false),
            trigger: Notify::new(),
            stats: Mutex::new(SyncStats::default()),
            events,
        }
    }

    /// Returns true if the device is considered online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns true while a pass is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sets the online flag; going online requests a pass.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "connectivity changed");
            self.events.emit(&SyncEvent::OnlineChanged(online));
            if online {
                self.request_sync();
            }
        }
    }

    /// Asks the run loop for a pass as soon as possible.
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Returns lifetime counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Returns the last sync time the next request would carry.
    ///
    /// That is the oldest per-kind time, or `None` if any synced kind has
    /// never completed a pass.
    pub fn last_sync_time(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let config = self.devices.config();
        let mut oldest: Option<DateTime<Utc>> = None;
        for kind in sync_kinds(&config) {
            match self.store.get_last_sync_time(kind)? {
                Some(at) => oldest = Some(oldest.map_or(at, |o| o.min(at))),
                None => return Ok(None),
            }
        }
        Ok(oldest)
    }

    /// Returns true if the last successful sync is older than the device's
    /// offline timeout. A device that never synced is not stale.
    pub fn is_stale(&self) -> SyncResult<bool> {
        let timeout_hours = i64::try_from(self.devices.config().offline_timeout_hours).unwrap_or(i64::MAX);
        let timeout = chrono::Duration::try_hours(timeout_hours).unwrap_or(chrono::Duration::MAX);
        Ok(match self.last_sync_time()? {
            Some(at) => self.clock.now().signed_duration_since(at) > timeout,
            None => false,
        })
    }

    /// Runs one sync pass.
    ///
    /// Returns a skipped report when offline, disabled or already
    /// running, and a failed report on transport failure.
    ///
    /// # Errors
    ///
    /// Storage failures abort the pass and are returned.
    pub async fn perform_sync(&self) -> SyncResult<SyncReport> {
        if !self.is_online() {
            return Ok(self.skip(SkipReason::Offline));
        }
        let config = self.devices.config();
        if !config.sync_enabled {
            return Ok(self.skip(SkipReason::Disabled));
        }
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            return Ok(self.skip(SkipReason::AlreadyRunning));
        };

        self.events.emit(&SyncEvent::SyncStarted);
        let result = self.run_pass(&config).await;
        let report = match &result {
            Ok(report) => report.clone(),
            Err(err) => SyncReport {
                error: Some(err.to_string()),
                ..SyncReport::default()
            },
        };
        self.stats.lock().record(&report, self.clock.now());
        self.events.emit(&SyncEvent::SyncFinished(report));
        result
    }

    /// Runs passes on the device's interval and on demand until `shutdown`
    /// turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = Duration::from_secs(self.devices.config().sync_interval_seconds.max(1));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.trigger.notified() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.perform_sync().await {
                error!(error = %err, "sync pass failed");
            }
        }
        debug!("sync loop stopped");
    }

    fn skip(&self, reason: SkipReason) -> SyncReport {
        debug!(?reason, "sync pass skipped");
        let report = SyncReport::skipped(reason);
        self.stats.lock().record(&report, self.clock.now());
        report
    }

    async fn run_pass(&self, config: &DeviceConfig) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();

        // Entities with an open conflict wait for a decision and must not
        // take up batch slots.
        let held: HashSet<EntityKey> = self
            .applier
            .resolver()
            .open_conflicts()?
            .iter()
            .map(|conflict| conflict.key())
            .filter(|key| self.queue.has_pending_for(key))
            .collect();
        for key in &held {
            debug!(entity_kind = %key.kind, entity_id = %key.id, "upload held back by open conflict");
        }
        report.held_back = held.len();

        let batch = self.queue.next_batch_excluding(config.max_batch_size, &held);
        let mut uploads: Vec<EffectiveChange> = Vec::new();

        for change in self.queue.effective_changes(&batch) {
            if change.is_cancelled() {
                for id in &change.operation_ids {
                    self.queue.report_outcome(*id, true, None)?;
                }
                debug!(entity_kind = %change.key.kind, entity_id = %change.key.id, "create and delete cancelled out");
                report.cancelled += 1;
            } else {
                uploads.push(change);
            }
        }

        let in_flight: Vec<_> = uploads
            .iter()
            .flat_map(|change| change.operation_ids.iter().copied())
            .collect();
        let request = ReconcileRequest {
            device_id: self.device_id.clone(),
            upload_changes: uploads
                .iter()
                .map(|change| self.to_remote(change))
                .collect::<SyncResult<_>>()?,
            last_sync_time: self.last_sync_time()?,
            entities: config.supported_entity_kinds.clone(),
        };
        self.queue.mark_processing(&in_flight)?;

        let response = match tokio::time::timeout(self.request_timeout, self.transport.reconcile(&request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, uploads = uploads.len(), "reconcile failed");
                if err.is_transport() {
                    // The server never judged these; they wait for the next pass.
                    self.queue.release(&in_flight, Some(&message))?;
                    report.error = Some(message);
                    return Ok(report);
                }
                for id in &in_flight {
                    self.queue.report_outcome(*id, false, Some(&message))?;
                }
                return Err(err);
            }
        };

        let acks: Option<HashMap<EntityKey, UploadAck>> = response
            .acknowledgements
            .map(|acks| acks.into_iter().map(|ack| (ack.key(), ack)).collect());
        for change in &uploads {
            let ack = match &acks {
                None => Ok(None),
                Some(acks) => match acks.get(&change.key) {
                    Some(ack) if ack.accepted => Ok(ack.version),
                    Some(ack) => Err(ack.error.clone().unwrap_or_else(|| "rejected".to_string())),
                    None => Err("missing acknowledgement".to_string()),
                },
            };
            match ack {
                Ok(version) => {
                    for id in &change.operation_ids {
                        self.queue.report_outcome(*id, true, None)?;
                    }
                    if let Some(version) = version {
                        self.adopt_version(&change.key, version)?;
                    }
                    report.uploaded += 1;
                }
                Err(reason) => {
                    warn!(entity_kind = %change.key.kind, entity_id = %change.key.id, %reason, "upload rejected");
                    for id in &change.operation_ids {
                        self.queue.report_outcome(*id, false, Some(&reason))?;
                    }
                    report.rejected += 1;
                }
            }
        }

        for change in &response.download_changes {
            if !config.supports(&change.entity_kind) {
                continue;
            }
            match self.applier.apply(change, ChangeSource::Download)? {
                ApplyOutcome::ConflictOpen(_) => report.conflicts += 1,
                ApplyOutcome::AutoResolved { .. } => report.auto_resolved += 1,
                ApplyOutcome::Stale => {}
                ApplyOutcome::Applied | ApplyOutcome::Adopted => report.downloaded += 1,
            }
        }

        for kind in sync_kinds(config) {
            self.store.set_last_sync_time(kind, response.timestamp)?;
        }

        report.success = true;
        report.server_timestamp = Some(response.timestamp);
        info!(
            batch_id = %response.upload_batch_id,
            uploaded = report.uploaded,
            rejected = report.rejected,
            downloaded = report.downloaded,
            conflicts = report.conflicts,
            auto_resolved = report.auto_resolved,
            "sync pass completed"
        );
        Ok(report)
    }

    fn to_remote(&self, change: &EffectiveChange) -> SyncResult<RemoteChange> {
        let version = self
            .store
            .get(&change.key.kind, &change.key.id)?
            .and_then(|snapshot| snapshot.version);
        Ok(RemoteChange {
            entity_kind: change.key.kind.clone(),
            // Cancelled changes never get here.
            operation: change.op_type.unwrap_or(offsync_protocol::OperationType::Delete),
            id: change.key.id.clone(),
            data: change.payload.clone(),
            timestamp: change.timestamp,
            version,
        })
    }

    fn adopt_version(&self, key: &EntityKey, version: u64) -> SyncResult<()> {
        if let Some(mut snapshot) = self.store.get(&key.kind, &key.id)? {
            if snapshot.version != Some(version) {
                snapshot.version = Some(version);
                self.store.put(snapshot)?;
            }
        }
        Ok(())
    }
}

fn sync_kinds(config: &DeviceConfig) -> Vec<&str> {
    if config.supported_entity_kinds.is_empty() {
        vec![ALL_KINDS]
    } else {
        config.supported_entity_kinds.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_exclusive_and_released() {
        let flag = AtomicBool::new(false);
        let guard = PassGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(PassGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(PassGuard::acquire(&flag).is_some());
    }

    #[test]
    fn stats_count_outcomes() {
        let now = Utc::now();
        let mut stats = SyncStats::default();
        stats.record(&SyncReport::skipped(SkipReason::Offline), now);
        stats.record(
            &SyncReport {
                success: true,
                uploaded: 2,
                downloaded: 3,
                ..SyncReport::default()
            },
            now,
        );
        stats.record(
            &SyncReport {
                error: Some("timeout".into()),
                ..SyncReport::default()
            },
            now,
        );

        assert_eq!(stats.skipped_passes, 1);
        assert_eq!(stats.passes, 2);
        assert_eq!(stats.successful_passes, 1);
        assert_eq!(stats.failed_passes, 1);
        assert_eq!(stats.uploaded, 2);
        assert_eq!(stats.downloaded, 3);
        assert_eq!(stats.last_success, Some(now));
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn all_kinds_key_when_unrestricted() {
        let mut config = DeviceConfig::defaults_for("dev");
        assert_eq!(sync_kinds(&config), vec![ALL_KINDS]);
        config.supported_entity_kinds = vec!["Customer".into(), "Product".into()];
        assert_eq!(sync_kinds(&config), vec!["Customer", "Product"]);
    }
}
