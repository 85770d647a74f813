//! Chaos testing for the sync client
//!
//! Failure scenarios using:
//! 1. **FailingRemote wrapper** - error injection at specific call numbers
//! 2. **Connectivity loss** - backend unreachable mid-drain
//! 3. **Restarts** - client dropped and reopened over the same database
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use care_sync::query::Query;
use care_sync::remote::memory::RemoteOp;
use care_sync::{
    InMemoryRemote, MutationState, Record, RemoteDataSource, RemoteError, SyncClient, SyncConfig, SyncState,
    WriteRequest,
};

const OWNER: &str = "patient-7";

// =============================================================================
// Failing Remote Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a backend and fails chosen write calls (1-indexed, lists not counted).
pub struct FailingRemote {
    inner: Arc<InMemoryRemote>,
    write_count: AtomicU64,
    fail_on_writes: Vec<u64>,
    error: RemoteError,
}

impl FailingRemote {
    pub fn new(inner: Arc<InMemoryRemote>, fail_on_writes: Vec<u64>, error: RemoteError) -> Self {
        Self {
            inner,
            write_count: AtomicU64::new(0),
            fail_on_writes,
            error,
        }
    }

    fn check(&self) -> Result<(), RemoteError> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_writes.contains(&n) {
            return Err(self.error.clone());
        }
        Ok(())
    }

    pub fn writes(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteDataSource for FailingRemote {
    async fn list(&self, query: &Query) -> Result<Vec<Record>, RemoteError> {
        self.inner.list(query).await
    }

    async fn insert(&self, collection: &str, payload: &Value) -> Result<Record, RemoteError> {
        self.check()?;
        self.inner.insert(collection, payload).await
    }

    async fn update(&self, collection: &str, id: &str, payload: &Value) -> Result<Record, RemoteError> {
        self.check()?;
        self.inner.update(collection, id, payload).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.inner.delete(collection, id).await
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        retry_initial_ms: 0,
        retry_max_ms: 0,
        retry_max_attempts: 3,
        ..Default::default()
    }
}

async fn create(client: &SyncClient, title: &str) -> String {
    client
        .write("tasks", WriteRequest::create(OWNER, json!({ "title": title })))
        .await
        .unwrap()
        .id
}

// =============================================================================
// Ordering under failure
// =============================================================================

#[tokio::test]
async fn test_transient_failure_preserves_fifo() {
    let backend = Arc::new(InMemoryRemote::new());
    let remote = Arc::new(FailingRemote::new(backend.clone(), vec![2], RemoteError::transient("connection reset")));
    let client = SyncClient::open(config(), remote.clone()).await.unwrap();

    for title in ["first", "second", "third"] {
        create(&client, title).await;
    }

    // Second write fails; the third must not overtake it
    let report = client.engine().drain_once().await.unwrap();
    assert_eq!(report.acked, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(backend.len("tasks"), 1);

    let report = client.sync_now().await.unwrap();
    assert_eq!(report.acked, 2);

    let titles: Vec<Value> = backend
        .write_calls()
        .iter()
        .filter(|c| c.served)
        .map(|c| c.body.as_ref().unwrap()["title"].clone())
        .collect();
    assert_eq!(titles, vec![json!("first"), json!("second"), json!("third")]);
}

#[tokio::test]
async fn test_connectivity_loss_mid_drain() {
    let backend = Arc::new(InMemoryRemote::new());
    let client = SyncClient::open(config(), backend.clone()).await.unwrap();
    for i in 0..5 {
        create(&client, &format!("task {i}")).await;
    }

    backend.set_offline(true);
    for _ in 0..3 {
        let report = client.sync_now().await.unwrap();
        assert_eq!(report.acked, 0);
    }
    // Nothing lost; the head of the queue may have run out of retries
    let stats = client.queue().stats().await.unwrap();
    assert_eq!(stats.queued + stats.failed, 5);

    backend.set_offline(false);
    let failed = client.failed_mutations().await.unwrap();
    for m in &failed {
        client.retry_failed(m.id).await.unwrap();
    }
    client.sync_now().await.unwrap();

    assert_eq!(backend.len("tasks"), 5);
    assert!(client.status().await.unwrap().is_settled());
}

// =============================================================================
// Rejections
// =============================================================================

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let backend = Arc::new(InMemoryRemote::new());
    let remote = Arc::new(FailingRemote::new(
        backend.clone(),
        vec![1],
        RemoteError::rejected(403, "row-level security"),
    ));
    let client = SyncClient::open(config(), remote.clone()).await.unwrap();

    let blocked = create(&client, "blocked").await;
    let other = create(&client, "other").await;

    let report = client.sync_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.acked, 1);

    // Further passes never resend the rejected write
    let writes = remote.writes();
    client.sync_now().await.unwrap();
    client.sync_now().await.unwrap();
    assert_eq!(remote.writes(), writes);

    let failed = client.failed_mutations().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity_id, blocked);
    assert_eq!(failed[0].state, MutationState::Failed);
    assert!(failed[0].last_error.as_deref().unwrap_or("").contains("row-level security"));

    let view = client.merged_view("tasks", OWNER).await.unwrap();
    assert_eq!(view.get(&blocked).unwrap().sync_state, SyncState::Failed);
    assert!(view.get(&other).is_none());
    assert_eq!(view.len(), 2);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_marks_failed() {
    let backend = Arc::new(InMemoryRemote::new());
    let client = SyncClient::open(config(), backend.clone()).await.unwrap();
    create(&client, "doomed").await;

    for _ in 0..4 {
        backend.fail_next(Some(RemoteOp::Insert), RemoteError::transient("503"));
    }
    for _ in 0..4 {
        client.sync_now().await.unwrap();
    }

    let failed = client.failed_mutations().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap_or("").contains("gave up after"));
    assert!(backend.is_empty("tasks"));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_concurrent_drains_send_each_write_once() {
    let backend = Arc::new(InMemoryRemote::new());
    backend.set_latency(Some(std::time::Duration::from_millis(20)));
    let client = SyncClient::open(config(), backend.clone()).await.unwrap();
    for i in 0..3 {
        create(&client, &format!("task {i}")).await;
    }

    let (a, b) = tokio::join!(client.sync_now(), client.sync_now());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.contended || b.contended);
    assert_eq!(a.acked + b.acked, 3);

    assert_eq!(backend.count_calls(RemoteOp::Insert), 3);
    assert_eq!(backend.len("tasks"), 3);
}

#[tokio::test]
async fn test_writes_during_drain_are_kept() {
    let backend = Arc::new(InMemoryRemote::new());
    backend.set_latency(Some(std::time::Duration::from_millis(20)));
    let client = Arc::new(SyncClient::open(config(), backend.clone()).await.unwrap());
    create(&client, "before").await;

    let drainer = {
        let client = client.clone();
        tokio::spawn(async move { client.sync_now().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    create(&client, "during").await;
    drainer.await.unwrap().unwrap();

    client.sync_now().await.unwrap();
    assert_eq!(backend.len("tasks"), 2);
    assert!(client.queue().is_empty().await.unwrap());
}

// =============================================================================
// Restarts
// =============================================================================

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("care.db").to_string_lossy().into_owned();
    let backend = Arc::new(InMemoryRemote::new());
    let config = SyncConfig {
        db_path: Some(db_path),
        ..config()
    };

    let local_id = {
        backend.set_offline(true);
        let client = SyncClient::open(config.clone(), backend.clone()).await.unwrap();
        let id = create(&client, "written offline").await;
        client.sync_now().await.unwrap();
        client.shutdown().await;
        id
    };

    backend.set_offline(false);
    let client = SyncClient::open(config, backend.clone()).await.unwrap();
    assert!(client.get_local("tasks", &local_id).await.unwrap().is_some());
    assert_eq!(client.queue().len().await.unwrap(), 1);

    client.sync_now().await.unwrap();
    assert_eq!(backend.len("tasks"), 1);

    let view = client.merged_view("tasks", OWNER).await.unwrap();
    assert_eq!(view.ids(), vec!["srv-1"]);
    assert_eq!(view.entities[0].payload, json!({"title": "written offline"}));
}

#[tokio::test]
async fn test_duplicate_ack_is_harmless() {
    let backend = Arc::new(InMemoryRemote::new());
    let client = SyncClient::open(config(), backend.clone()).await.unwrap();
    create(&client, "once").await;

    let mutation = client.queue().list().await.unwrap().remove(0);
    client.sync_now().await.unwrap();

    assert!(!client.queue().ack(mutation.id).await.unwrap());
    assert!(client.queue().is_empty().await.unwrap());
    assert_eq!(client.merged_view("tasks", OWNER).await.unwrap().len(), 1);
}
