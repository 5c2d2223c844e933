//! Test fixtures and engine helpers.
//!
//! Provides a fixed clock, engine configurations tuned for fast tests,
//! sample business documents and a harness wiring an engine to the
//! in-memory server.

use crate::push::ScriptedPush;
use crate::server::InMemoryServer;
use chrono::{DateTime, TimeZone, Utc};
use offsync_engine::{EngineConfig, RetryConfig, SyncEngine};
use offsync_protocol::{Clock, ManualClock};
use offsync_store::{FileStore, FileStoreOptions, LocalStore, MemoryStore};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Server URL used by test configurations. Never contacted.
pub const TEST_SERVER_URL: &str = "http://sync.test";

/// The instant every test clock starts at.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0)
        .single()
        .expect("valid start time")
}

/// A manual clock at [`start_time`].
pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Engine configuration for tests.
///
/// Queue backoff is 1s doubling without jitter, reconnects are fast and
/// network calls time out after 500ms.
pub fn test_config(device_id: &str) -> EngineConfig {
    EngineConfig::new(device_id, TEST_SERVER_URL)
        .with_request_timeout(Duration::from_millis(500))
        .with_queue_retry(RetryConfig::queue())
        .with_reconnect_retry(
            RetryConfig::reconnect()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(50))
                .with_jitter(false),
        )
}

/// A customer document.
pub fn customer(name: &str, email: &str) -> Value {
    json!({ "name": name, "email": email })
}

/// A product variant document.
pub fn product_variant(sku: &str, stock: i64) -> Value {
    json!({ "sku": sku, "stockQuantity": stock })
}

/// An invoice document.
pub fn invoice(number: &str, total: f64) -> Value {
    json!({ "invoiceNumber": number, "totalAmount": total, "status": "open" })
}

/// A file store in a temporary directory that can be reopened.
pub struct TempStore {
    dir: TempDir,
}

impl TempStore {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Journal path.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("offsync.journal")
    }

    /// Opens the store. Drop earlier handles first; the journal is locked.
    pub fn open(&self) -> Arc<FileStore> {
        open_file_store(&self.path())
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::new()
    }
}

fn open_file_store(path: &Path) -> Arc<FileStore> {
    Arc::new(
        FileStore::open_with_options(path, FileStoreOptions::default().with_sync_on_write(false))
            .expect("Failed to open file store"),
    )
}

/// An engine wired to an [`InMemoryServer`] and a manual clock.
pub struct TestHarness {
    /// The engine under test.
    pub engine: SyncEngine,
    /// The server it talks to.
    pub server: Arc<InMemoryServer>,
    /// Shared clock of engine and server.
    pub clock: Arc<ManualClock>,
    /// The engine's store.
    pub store: Arc<dyn LocalStore>,
    /// Push channel, when built with [`TestHarness::with_push`].
    pub push: Option<ScriptedPush>,
}

impl TestHarness {
    /// An engine over a memory store.
    pub fn new(device_id: &str) -> Self {
        let clock = test_clock();
        let server = Arc::new(InMemoryServer::new(clock.clone()));
        Self::build(device_id, Arc::new(MemoryStore::new()), server, clock, None)
    }

    /// An engine over a memory store with a scripted push channel.
    pub fn with_push(device_id: &str) -> Self {
        let clock = test_clock();
        let server = Arc::new(InMemoryServer::new(clock.clone()));
        Self::build(
            device_id,
            Arc::new(MemoryStore::new()),
            server,
            clock,
            Some(ScriptedPush::new()),
        )
    }

    /// An engine over `store`, sharing `server` and `clock` with other
    /// harnesses.
    pub fn build(
        device_id: &str,
        store: Arc<dyn LocalStore>,
        server: Arc<InMemoryServer>,
        clock: Arc<ManualClock>,
        push: Option<ScriptedPush>,
    ) -> Self {
        let mut builder = SyncEngine::builder(test_config(device_id), Arc::clone(&store))
            .transport(server.clone())
            .clock(clock.clone());
        if let Some(push) = &push {
            builder = builder.push_connector(Arc::new(push.clone()));
        }
        let engine = builder.build().expect("Failed to build engine");
        Self {
            engine,
            server,
            clock,
            store,
            push,
        }
    }

    /// Advances the shared clock.
    pub fn advance(&self, by: Duration) {
        self.clock
            .advance_millis(i64::try_from(by.as_millis()).unwrap_or(i64::MAX));
    }

    /// Returns the current time of the shared clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
