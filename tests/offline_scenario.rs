//! End-to-end offline scenarios against the in-memory backend.
//!
//! Walks a patient's day: tasks written with no connectivity, read back from
//! the local store, then confirmed by the backend once the network returns.
//!
//! Run with: `cargo test --test offline_scenario`

use std::sync::Arc;

use serde_json::json;

use care_sync::remote::memory::RemoteOp;
use care_sync::{
    ClientState, InMemoryRemote, Origin, RemoteDataSource, SyncClient, SyncConfig, SyncState, WriteRequest,
};

const OWNER: &str = "patient-7";

fn config() -> SyncConfig {
    SyncConfig {
        cacheable: [("tasks".to_string(), None), ("logs".to_string(), Some(60))]
            .into_iter()
            .collect(),
        retry_initial_ms: 0,
        retry_max_ms: 0,
        ..Default::default()
    }
}

async fn client() -> (Arc<InMemoryRemote>, SyncClient) {
    let remote = Arc::new(InMemoryRemote::new());
    let client = SyncClient::open(config(), remote.clone()).await.unwrap();
    (remote, client)
}

#[tokio::test]
async fn test_offline_create_survives_reconnect() {
    let (remote, client) = client().await;
    remote.set_offline(true);

    let task = client
        .write("tasks", WriteRequest::create(OWNER, json!({"title": "Walk 20 min"})))
        .await
        .unwrap();
    assert!(task.id.starts_with("local-"));

    // Offline read falls back to what the device knows
    let view = client.merged_view("tasks", OWNER).await.unwrap();
    assert!(view.offline);
    assert_eq!(view.ids(), vec![task.id.as_str()]);
    let entity = view.get(&task.id).unwrap();
    assert_eq!(entity.origin, Origin::PendingCreate);
    assert_eq!(entity.sync_state, SyncState::Pending);

    // Drain while offline: nothing confirmed, nothing lost
    let report = client.sync_now().await.unwrap();
    assert_eq!(report.acked, 0);
    assert_eq!(report.retried, 1);
    assert_eq!(client.queue().len().await.unwrap(), 1);

    remote.set_offline(false);
    let report = client.sync_now().await.unwrap();
    assert_eq!(report.acked, 1);

    let view = client.merged_view("tasks", OWNER).await.unwrap();
    assert!(!view.offline);
    assert_eq!(view.ids(), vec!["srv-1"]);
    let entity = view.get("srv-1").unwrap();
    assert_eq!(entity.origin, Origin::Remote);
    assert_eq!(entity.sync_state, SyncState::Synced);
    assert_eq!(entity.payload, json!({"title": "Walk 20 min"}));

    assert!(client.get_local("tasks", &task.id).await.unwrap().is_none());
    assert!(client.status().await.unwrap().is_settled());
}

#[tokio::test]
async fn test_edits_to_offline_create_follow_the_new_id() {
    let (remote, client) = client().await;
    remote.set_offline(true);

    let task = client
        .write("tasks", WriteRequest::create(OWNER, json!({"title": "Stretch"})))
        .await
        .unwrap();
    client
        .write("tasks", WriteRequest::update(&task.id, OWNER, json!({"title": "Stretch", "done": true})))
        .await
        .unwrap();

    remote.set_offline(false);
    let report = client.sync_now().await.unwrap();
    assert_eq!(report.acked, 2);

    let writes = remote.write_calls();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].op, RemoteOp::Insert);
    assert_eq!(writes[1].op, RemoteOp::Update);
    assert_eq!(writes[1].id.as_deref(), Some("srv-1"));

    let record = remote.record("tasks", "srv-1").unwrap();
    assert_eq!(record.payload, json!({"title": "Stretch", "done": true}));
}

#[tokio::test]
async fn test_merged_view_is_newest_first_across_sources() {
    let (remote, client) = client().await;
    let older = remote
        .insert("tasks", &json!({"owner_id": OWNER, "title": "Morning meds"}))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let newer = client
        .write("tasks", WriteRequest::create(OWNER, json!({"title": "Evening walk"})))
        .await
        .unwrap();

    let view = client.merged_view("tasks", OWNER).await.unwrap();
    assert_eq!(view.ids(), vec![newer.id.as_str(), older.id.as_str()]);
    assert_eq!(view.pending().count(), 1);
}

#[tokio::test]
async fn test_other_owners_rows_are_not_visible() {
    let (remote, client) = client().await;
    remote
        .insert("logs", &json!({"owner_id": "patient-9", "mood": 3}))
        .await
        .unwrap();
    client
        .write("logs", WriteRequest::create(OWNER, json!({"mood": 4})))
        .await
        .unwrap();

    let view = client.merged_view("logs", OWNER).await.unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view.entities[0].owner_id, OWNER);
}

#[tokio::test]
async fn test_background_loop_drains_writes() {
    let (remote, client) = client().await;
    client.start();
    assert_eq!(client.state(), ClientState::Running);

    client
        .write("tasks", WriteRequest::create(OWNER, json!({"title": "Hydrate"})))
        .await
        .unwrap();

    // Writes wake the loop; poll until it catches up
    for _ in 0..100 {
        if remote.len("tasks") == 1 && client.queue().is_empty().await.unwrap() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(remote.len("tasks"), 1);
    assert!(client.queue().is_empty().await.unwrap());

    client.shutdown().await;
    assert_eq!(client.state(), ClientState::Stopped);
}

#[tokio::test]
async fn test_refresh_bypasses_fresh_cache() {
    let (remote, client) = client().await;
    client.merged_view("tasks", OWNER).await.unwrap();

    // A write from another device, invisible to this client's cache
    remote
        .insert("tasks", &json!({"owner_id": OWNER, "title": "From the web"}))
        .await
        .unwrap();

    let cached = client.merged_view("tasks", OWNER).await.unwrap();
    assert!(cached.from_cache);
    assert!(cached.is_empty());

    let fresh = client.refresh_view("tasks", OWNER).await.unwrap();
    assert!(!fresh.from_cache);
    assert_eq!(fresh.len(), 1);
    assert_eq!(remote.count_calls(RemoteOp::List), 2);
}
