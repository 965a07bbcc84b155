//! Several clients over one storage directory.

use harbor_sync::{OfflineClient, SyncConfig};
use harbor_testkit::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn sibling_client(t: &TestClient, config: SyncConfig) -> OfflineClient {
    OfflineClient::open(t.store.sibling(), Arc::new(t.remote.clone()), config).unwrap()
}

#[tokio::test]
async fn reload_picks_up_sibling_writes() {
    let t = offline_client();
    let other = sibling_client(&t, SyncConfig::new().start_online(false));

    t.create_record(json!({"id": "A", "price": 1})).await.unwrap();
    assert!(other.get_record("A").unwrap().is_none());

    other.reload_from_storage().unwrap();
    assert_eq!(
        other.get_record("A").unwrap().unwrap().field("price"),
        Some(&json!(1))
    );
    assert_eq!(other.pending_operations().len(), 1);
}

#[tokio::test]
async fn storage_watch_refreshes_views() {
    let t = offline_client();
    let other = sibling_client(
        &t,
        SyncConfig::new().start_online(false).with_storage_watch(true),
    );
    let handle = other.start_background();

    t.create_record(json!({"id": "A"})).await.unwrap();

    let mut seen = false;
    for _ in 0..100 {
        if other.get_record("A").unwrap().is_some() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.stop().await;
    assert!(seen, "sibling never saw the write");
}

#[tokio::test]
async fn background_loop_drains_on_reconnect() {
    let t = offline_client();
    let handle = t.start_background();

    t.create_record(json!({"id": "A"})).await.unwrap();
    t.set_online(true);

    let mut drained = false;
    for _ in 0..100 {
        if t.pending_operations().is_empty() {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.stop().await;
    assert!(drained);
    assert!(t.remote.record("A").is_some());
}
