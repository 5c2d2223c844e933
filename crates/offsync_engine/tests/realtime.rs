//! Integration tests for the push channel feeding the engine.

use offsync_engine::{ConnectionState, NewOperation, SyncEvent};
use offsync_protocol::{ClientFrame, PushUpdate, ServerFrame};
use offsync_testkit::prelude::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Polls `condition` until it holds or two seconds pass.
async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn push_updates_are_applied() {
    let h = TestHarness::with_push("pos-1");
    let push = h.push.clone().unwrap();
    h.engine.start().await.unwrap();
    h.engine.subscribe("Product", None);
    eventually(|| push.is_connected()).await;

    let change = h
        .server
        .server_edit("Product", "p1", json!({"name": "Coffee", "price": 3.5}));
    assert!(push.deliver_changes(vec![change]));

    eventually(|| h.store.get("Product", "p1").unwrap().is_some()).await;
    let local = h.store.get("Product", "p1").unwrap().unwrap();
    assert_eq!(local.data, json!({"name": "Coffee", "price": 3.5}));
    assert_eq!(local.version, Some(1));

    eventually(|| {
        push.sent_frames().contains(&ClientFrame::Subscribe {
            entity_kind: "Product".into(),
            entity_id: None,
        })
    })
    .await;
    assert_eq!(push.identities()[0].device_id.as_deref(), Some("pos-1"));

    h.engine.shutdown().await;
    assert_eq!(
        h.engine.connection_status().map(|s| s.state),
        Some(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn entity_updates_without_version_are_applied() {
    let h = TestHarness::with_push("pos-1");
    let push = h.push.clone().unwrap();
    h.engine.start().await.unwrap();
    eventually(|| push.is_connected()).await;

    push.deliver(ServerFrame::EntityUpdate(PushUpdate {
        entity_kind: "Customer".into(),
        entity_id: None,
        data: json!({"id": "c7", "name": "Eve"}),
        timestamp: h.now(),
        source_user_id: Some("u-2".into()),
    }));

    eventually(|| h.store.get("Customer", "c7").unwrap().is_some()).await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn subscriptions_survive_reconnects() {
    let h = TestHarness::with_push("pos-1");
    let push = h.push.clone().unwrap();
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let _sub = h.engine.on_event(move |event| {
        if let SyncEvent::ConnectionChanged(state) = event {
            sink.lock().push(*state);
        }
    });

    h.engine.start().await.unwrap();
    eventually(|| push.is_connected()).await;
    h.engine.subscribe("Customer", Some("42".into()));
    eventually(|| !push.sent_frames().is_empty()).await;
    let before = push.sent_frames().len();

    push.drop_connection();
    eventually(|| push.connect_count() == 2 && push.is_connected()).await;
    eventually(|| push.sent_frames().len() > before).await;

    let subscribe = ClientFrame::Subscribe {
        entity_kind: "Customer".into(),
        entity_id: Some("42".into()),
    };
    assert!(push.sent_frames().iter().all(|frame| *frame == subscribe));
    assert!(states.lock().contains(&ConnectionState::Disconnected));
    assert_eq!(states.lock().last(), Some(&ConnectionState::Connected));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn refused_connections_are_retried() {
    let h = TestHarness::with_push("pos-1");
    let push = h.push.clone().unwrap();
    push.refuse_connections(true);
    h.engine.start().await.unwrap();

    eventually(|| {
        h.engine
            .connection_status()
            .is_some_and(|status| status.attempts >= 2)
    })
    .await;

    push.refuse_connections(false);
    eventually(|| push.is_connected()).await;
    eventually(|| {
        h.engine
            .connection_status()
            .is_some_and(|status| status.state == ConnectionState::Connected && status.attempts == 0)
    })
    .await;

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_change_by_push_and_pull_opens_one_conflict() {
    let h = TestHarness::with_push("pos-1");
    let push = h.push.clone().unwrap();
    h.server.server_edit("Customer", "2", customer("Bob", "bob@example.com"));
    assert!(h.engine.sync_now().await.unwrap().success);

    h.engine.start().await.unwrap();
    eventually(|| push.is_connected()).await;

    h.advance(Duration::from_secs(1));
    h.engine
        .enqueue(NewOperation::update("Customer", "2", customer("Bob", "bob@local.example")))
        .unwrap();
    let change = h
        .server
        .server_edit("Customer", "2", customer("Bob", "bob@server.example"));
    h.advance(Duration::from_secs(1));

    let (delivered, _) = tokio::join!(
        async { push.deliver_changes(vec![change]) },
        h.engine.sync_now()
    );
    assert!(delivered);

    eventually(|| !h.engine.open_conflicts().unwrap().is_empty()).await;
    // Let whichever path came second finish
    tokio::time::sleep(Duration::from_millis(100)).await;

    let open = h.engine.open_conflicts().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].server_version.version, Some(2));
    assert_eq!(
        h.store.get("Customer", "2").unwrap().unwrap().data,
        customer("Bob", "bob@local.example")
    );
    h.engine.shutdown().await;
}
