//! Integration tests for conflict detection and resolution across passes.

use offsync_conflict::ManualResolution;
use offsync_engine::{NewOperation, SyncEngine, SyncEvent};
use offsync_protocol::{DeviceConfig, ResolutionChoice, Severity};
use offsync_testkit::prelude::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Syncs a server-side entity down, edits it locally and lets the server
/// change it again, leaving one local edit that raced a server edit.
async fn race(h: &TestHarness, kind: &str, id: &str, base: Value, local: Value, server: Value) {
    h.server.server_edit(kind, id, base);
    assert!(h.engine.sync_now().await.unwrap().success);

    h.advance(Duration::from_secs(1));
    h.engine
        .enqueue(NewOperation::update(kind, id, local))
        .unwrap();
    h.server.server_edit(kind, id, server);
    h.advance(Duration::from_secs(1));
}

fn detected_conflicts(engine: &SyncEngine) -> Arc<Mutex<Vec<offsync_protocol::Conflict>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    // Kept registered for the whole test
    let _ = engine.on_conflict(move |conflict| sink.lock().push(conflict.clone()));
    seen
}

#[tokio::test]
async fn email_change_needs_a_decision() {
    let h = TestHarness::new("pos-1");
    let seen = detected_conflicts(&h.engine);
    race(
        &h,
        "Customer",
        "2",
        customer("Bob", "bob@example.com"),
        customer("Bob", "bob@local.example"),
        customer("Bob", "bob@server.example"),
    )
    .await;

    let report = h.engine.sync_now().await.unwrap();

    assert!(report.success);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.conflicts, 1);

    let open = h.engine.open_conflicts().unwrap();
    assert_eq!(open.len(), 1);
    let conflict = &open[0];
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].id, conflict.id);
    assert_eq!(conflict.server_version.version, Some(2));
    assert_eq!(conflict.local_version.data, customer("Bob", "bob@local.example"));

    let analysis = h
        .engine
        .resolver()
        .analyzer()
        .analyze(&conflict.local_version, &conflict.server_version);
    assert!(analysis.severity >= Severity::Medium);
    assert_eq!(analysis.recommended_action, ResolutionChoice::Manual);

    // Local data is untouched while the conflict is open
    assert_eq!(
        h.store.get("Customer", "2").unwrap().unwrap().data,
        customer("Bob", "bob@local.example")
    );
    assert_eq!(h.engine.get_stats().unwrap().open_conflicts, 1);
}

#[tokio::test]
async fn open_conflict_holds_back_uploads() {
    let h = TestHarness::new("pos-1");
    race(
        &h,
        "Customer",
        "2",
        customer("Bob", "bob@example.com"),
        customer("Bob", "bob@local.example"),
        customer("Bob", "bob@server.example"),
    )
    .await;
    h.engine.sync_now().await.unwrap();

    h.advance(Duration::from_secs(5));
    let report = h.engine.sync_now().await.unwrap();

    assert_eq!(report.held_back, 1);
    assert_eq!(report.uploaded, 0);
    assert_eq!(h.engine.queue().len(), 1);
}

#[tokio::test]
async fn held_back_entities_do_not_starve_small_batches() {
    let h = TestHarness::new("pos-1");
    let mut config = DeviceConfig::defaults_for("pos-1");
    config.max_batch_size = 1;
    h.server.set_device_config(config);
    h.engine.refresh_device_config().await.unwrap();

    h.server.server_edit("Customer", "5", customer("Cy", "c@example.com"));
    race(
        &h,
        "Customer",
        "2",
        customer("Bob", "bob@example.com"),
        customer("Bob", "bob@local.example"),
        customer("Bob", "bob@server.example"),
    )
    .await;
    h.engine.sync_now().await.unwrap();
    assert_eq!(h.engine.open_conflicts().unwrap().len(), 1);

    h.advance(Duration::from_secs(5));
    h.engine
        .enqueue(NewOperation::update("Customer", "5", customer("Cy", "new@example.com")))
        .unwrap();
    let report = h.engine.sync_now().await.unwrap();

    assert_eq!(report.held_back, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(
        h.server.entity("Customer", "5"),
        Some((customer("Cy", "new@example.com"), 2))
    );
    assert_eq!(h.engine.queue().len(), 1);
}

#[tokio::test]
async fn keeping_the_local_side_uploads_it() {
    let h = TestHarness::new("pos-1");
    let resolved = Arc::new(Mutex::new(Vec::new()));
    let sink = resolved.clone();
    let _sub = h.engine.on_event(move |event| {
        if let SyncEvent::ConflictResolved(record) = event {
            sink.lock().push(record.clone());
        }
    });
    race(
        &h,
        "Customer",
        "2",
        customer("Bob", "bob@example.com"),
        customer("Bob", "bob@local.example"),
        customer("Bob", "bob@server.example"),
    )
    .await;
    h.engine.sync_now().await.unwrap();
    let conflict = h.engine.open_conflicts().unwrap().remove(0);

    let record = h
        .engine
        .resolve_conflict(conflict.id, ManualResolution::local().with_notes("confirmed by phone"))
        .unwrap();
    assert_eq!(record.choice, ResolutionChoice::Local);
    assert!(!record.automatic);
    assert_eq!(resolved.lock().len(), 1);
    assert_eq!(h.store.get("Customer", "2").unwrap().unwrap().version, Some(2));

    h.advance(Duration::from_secs(2));
    let report = h.engine.sync_now().await.unwrap();

    assert_eq!(report.uploaded, 1);
    assert!(h.engine.queue().is_empty());
    assert!(h.engine.open_conflicts().unwrap().is_empty());
    assert_eq!(
        h.server.entity("Customer", "2"),
        Some((customer("Bob", "bob@local.example"), 3))
    );
    assert_eq!(h.engine.conflict_history(Some("Customer")).unwrap().len(), 1);
}

#[tokio::test]
async fn taking_the_server_side_drops_the_local_edit() {
    let h = TestHarness::new("pos-1");
    race(
        &h,
        "Customer",
        "2",
        customer("Bob", "bob@example.com"),
        customer("Bob", "bob@local.example"),
        customer("Bob", "bob@server.example"),
    )
    .await;
    h.engine.sync_now().await.unwrap();
    let conflict = h.engine.open_conflicts().unwrap().remove(0);

    h.engine
        .resolve_conflict(conflict.id, ManualResolution::server())
        .unwrap();

    assert!(h.engine.queue().is_empty());
    let local = h.store.get("Customer", "2").unwrap().unwrap();
    assert_eq!(local.data, customer("Bob", "bob@server.example"));
    assert_eq!(local.version, Some(2));

    // A second decision on the same conflict is refused
    assert!(h
        .engine
        .resolve_conflict(conflict.id, ManualResolution::local())
        .is_err());
}

#[tokio::test]
async fn stock_conflicts_merge_automatically() {
    let h = TestHarness::new("pos-1");
    race(
        &h,
        "ProductVariant",
        "3",
        product_variant("SKU-3", 5),
        product_variant("SKU-3", 10),
        product_variant("SKU-3", 7),
    )
    .await;

    let report = h.engine.sync_now().await.unwrap();

    assert_eq!(report.auto_resolved, 1);
    assert_eq!(report.conflicts, 0);
    assert!(h.engine.open_conflicts().unwrap().is_empty());
    let local = h.store.get("ProductVariant", "3").unwrap().unwrap();
    assert_eq!(local.data, product_variant("SKU-3", 10));
    assert_eq!(local.version, Some(2));

    let history = h.engine.conflict_history(None).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].automatic);
    assert_eq!(history[0].strategy.as_deref(), Some("quantity_merge"));

    h.advance(Duration::from_secs(2));
    let report = h.engine.sync_now().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(
        h.server.entity("ProductVariant", "3"),
        Some((product_variant("SKU-3", 10), 3))
    );

    let stats = h.engine.strategy_stats(None).unwrap();
    assert_eq!(stats.len(), 1);
}

#[tokio::test]
async fn later_server_change_updates_the_open_conflict() {
    let h = TestHarness::new("pos-1");
    let updated = Arc::new(Mutex::new(0));
    let counter = updated.clone();
    let _sub = h.engine.on_event(move |event| {
        if matches!(event, SyncEvent::ConflictUpdated(_)) {
            *counter.lock() += 1;
        }
    });
    race(
        &h,
        "Customer",
        "2",
        customer("Bob", "bob@example.com"),
        customer("Bob", "bob@local.example"),
        customer("Bob", "bob@server.example"),
    )
    .await;
    h.engine.sync_now().await.unwrap();

    h.server
        .server_edit("Customer", "2", customer("Bob", "bob@third.example"));
    h.advance(Duration::from_secs(1));
    h.engine.sync_now().await.unwrap();

    let open = h.engine.open_conflicts().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].server_version.version, Some(3));
    assert_eq!(open[0].server_version.data, customer("Bob", "bob@third.example"));
    assert!(*updated.lock() >= 1);
}

#[tokio::test]
async fn merge_without_data_is_refused() {
    let h = TestHarness::new("pos-1");
    race(
        &h,
        "Customer",
        "2",
        customer("Bob", "bob@example.com"),
        customer("Bob", "bob@local.example"),
        customer("Bob", "bob@server.example"),
    )
    .await;
    h.engine.sync_now().await.unwrap();
    let conflict = h.engine.open_conflicts().unwrap().remove(0);

    let mut invalid = ManualResolution::merge(json!(null));
    invalid.data = None;
    assert!(h.engine.resolve_conflict(conflict.id, invalid).is_err());
    assert_eq!(h.engine.open_conflicts().unwrap().len(), 1);

    h.engine
        .resolve_conflict(
            conflict.id,
            ManualResolution::merge(customer("Bob", "bob@merged.example")),
        )
        .unwrap();
    assert_eq!(
        h.store.get("Customer", "2").unwrap().unwrap().data,
        customer("Bob", "bob@merged.example")
    );
}
