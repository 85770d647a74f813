// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync client.
//!
//! The [`SyncClient`] is the one service object a process constructs. It
//! owns every component:
//! - Read cache in front of the remote backend
//! - SQLite local store and mutation queue (same file)
//! - Reconciler producing the merged view
//! - Background [`SyncEngine`] replaying the queue
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! Reads and writes work in every state; only the background drain needs
//! [`start()`](SyncClient::start).
//!
//! # Example
//!
//! ```rust,no_run
//! use care_sync::{ClientState, InMemoryRemote, SyncClient, SyncConfig, WriteRequest};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), care_sync::SyncError> {
//! let client = SyncClient::open(SyncConfig::default(), Arc::new(InMemoryRemote::new())).await?;
//! assert_eq!(client.state(), ClientState::Created);
//!
//! let task = client
//!     .write("tasks", WriteRequest::create("patient-7", json!({"title": "Walk 20 min"})))
//!     .await?;
//! assert!(task.id.starts_with("local-"));
//!
//! client.start();
//! let view = client.merged_view("tasks", "patient-7").await?;
//! assert_eq!(view.len(), 1);
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod engine;
mod types;

pub use engine::SyncEngine;
pub use types::{ClientState, DrainReport, SyncStatus, WriteRequest};

use parking_lot::Mutex;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{GetOptions, Invalidation, ReadCache};
use crate::config::SyncConfig;
use crate::entity::{now_millis, LocalEntity, LOCAL_ID_PREFIX};
use crate::error::SyncError;
use crate::query::is_valid_collection;
use crate::queue::{self, MutationMethod, MutationQueue, MutationState, NewMutation, PendingMutation};
use crate::reconcile::{MergedView, SyncReconciler};
use crate::remote::{row_body, RemoteDataSource};
use crate::resilience::health::ConnectivityMonitor;
use crate::storage::local::{self, LocalStore, WriteOrigin};
use crate::storage::memory::MemoryCacheStore;
use crate::storage::traits::{CacheStore, StorageError};

pub struct SyncClient {
    config: SyncConfig,
    state: watch::Sender<ClientState>,
    state_rx: watch::Receiver<ClientState>,
    local: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    cache: Arc<ReadCache>,
    reconciler: SyncReconciler,
    engine: Arc<SyncEngine>,
    monitor: Arc<ConnectivityMonitor>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    /// Open local storage and wire up the components, with an in-process cache.
    pub async fn open(config: SyncConfig, remote: Arc<dyn RemoteDataSource>) -> Result<Self, SyncError> {
        Self::open_with_cache_store(config, remote, Arc::new(MemoryCacheStore::new())).await
    }

    pub async fn open_with_cache_store(
        config: SyncConfig,
        remote: Arc<dyn RemoteDataSource>,
        cache_store: Arc<dyn CacheStore>,
    ) -> Result<Self, SyncError> {
        let local = match config.db_path {
            Some(ref path) => LocalStore::open(path).await?,
            None => {
                warn!("No db_path configured, local writes will not survive a restart");
                LocalStore::in_memory().await?
            }
        };
        let local = Arc::new(local);
        let queue = Arc::new(MutationQueue::open(local.pool()).await?);

        let monitor = Arc::new(ConnectivityMonitor::new());
        let cache = Arc::new(ReadCache::new(remote.clone(), cache_store, &config, monitor.clone()));
        let reconciler = SyncReconciler::new(cache.clone(), local.clone(), queue.clone(), config.clock_skew_tolerance_ms);
        let engine = Arc::new(SyncEngine::new(
            remote,
            local.clone(),
            queue.clone(),
            cache.clone(),
            monitor.clone(),
            config.retry_config(),
            config.drain_batch_size,
        ));

        let (state_tx, state_rx) = watch::channel(ClientState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        crate::metrics::set_client_state("Created");
        info!(location = local.location(), "Sync client opened");

        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            local,
            queue,
            cache,
            reconciler,
            engine,
            monitor,
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    /// Spawn the background drain loop. No-op if it is already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        self.shutdown_tx.send_replace(false);
        let engine = self.engine.clone();
        let rx = self.shutdown_tx.subscribe();
        *worker = Some(tokio::spawn(engine.run(self.config.drain_interval(), rx)));

        self.set_state(ClientState::Running);
    }

    /// Stop the drain loop, letting an in-progress pass finish.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            self.set_state(ClientState::Stopped);
            return;
        };

        self.set_state(ClientState::ShuttingDown);
        self.shutdown_tx.send_replace(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Drain loop ended abnormally");
        }
        self.set_state(ClientState::Stopped);
        info!("Sync client stopped");
    }

    /// Merged view of `collection` for `owner_id` (cache first).
    pub async fn merged_view(&self, collection: &str, owner_id: &str) -> Result<MergedView, SyncError> {
        self.reconciler
            .merged_view(collection, owner_id, GetOptions::default())
            .await
    }

    /// Merged view with a forced remote read.
    pub async fn refresh_view(&self, collection: &str, owner_id: &str) -> Result<MergedView, SyncError> {
        self.reconciler
            .merged_view(collection, owner_id, GetOptions::refresh())
            .await
    }

    /// Apply a write locally and queue it for the backend.
    ///
    /// Returns once the local store and the queue hold the write (one
    /// transaction) and the collection's cache entries are gone; the remote
    /// call happens later. A local storage failure means nothing was
    /// recorded. Updates and deletes may still name an entity by the
    /// `local-*` id its create returned after the backend assigned a server id.
    #[tracing::instrument(skip(self, request))]
    pub async fn write(&self, collection: &str, request: WriteRequest) -> Result<LocalEntity, SyncError> {
        if !is_valid_collection(collection) {
            return Err(SyncError::InvalidCollection(collection.to_string()));
        }
        if let WriteRequest::Create { payload, .. } | WriteRequest::Update { payload, .. } = &request {
            if !payload.is_object() {
                return Err(SyncError::InvalidPayload);
            }
        }
        self.local.ensure_collection(collection).await?;

        let mut tx = self.local.begin_write().await?;
        let (stored, method) = match request {
            WriteRequest::Create { owner_id, payload } => {
                let entity = LocalEntity::new_local(collection, owner_id, payload);
                let stored = local::put_on(&mut tx, &entity, WriteOrigin::Local).await?;
                queue::enqueue_on(&mut tx, &mutation(MutationMethod::Create, &stored)).await?;
                (stored, MutationMethod::Create)
            }
            WriteRequest::Update { id, owner_id, payload } => {
                let (id, existing) = resolve_target(&mut tx, collection, id).await?;
                if existing.as_ref().is_some_and(|e| e.deleted) {
                    return Err(SyncError::NotFound {
                        collection: collection.to_string(),
                        id,
                    });
                }
                let entity = LocalEntity {
                    payload,
                    owner_id,
                    ..existing.unwrap_or_else(|| blank(collection, &id))
                };
                let stored = local::put_on(&mut tx, &entity, WriteOrigin::Local).await?;
                queue::enqueue_on(&mut tx, &mutation(MutationMethod::Update, &stored)).await?;
                (stored, MutationMethod::Update)
            }
            WriteRequest::Delete { id, owner_id } => {
                let (id, existing) = resolve_target(&mut tx, collection, id).await?;
                let pending = queue::pending_for_entity_on(&mut tx, collection, &id).await?;

                // A create the backend never saw can just be forgotten
                let never_sent = id.starts_with(LOCAL_ID_PREFIX)
                    && pending.first().is_some_and(|m| {
                        m.method == MutationMethod::Create && m.state == MutationState::Queued
                    })
                    && pending.iter().all(|m| m.state != MutationState::InFlight);

                let mut tombstone = existing.unwrap_or_else(|| LocalEntity {
                    owner_id: owner_id.clone(),
                    ..blank(collection, &id)
                });
                tombstone.deleted = true;

                if never_sent {
                    for m in &pending {
                        queue::ack_on(&mut tx, m.id).await?;
                    }
                    local::delete_on(&mut tx, collection, &id).await?;
                    (tombstone, MutationMethod::Delete)
                } else {
                    let stored = local::put_on(&mut tx, &tombstone, WriteOrigin::Local).await?;
                    queue::enqueue_on(&mut tx, &mutation(MutationMethod::Delete, &stored)).await?;
                    (stored, MutationMethod::Delete)
                }
            }
        };
        tx.commit().await.map_err(StorageError::from)?;

        self.cache
            .invalidate(Invalidation::Collection(collection.to_string()))
            .await;
        self.engine.wake();
        crate::metrics::record_local_write(collection, method.as_str());
        Ok(stored)
    }

    /// Local copy of one entity, if any. A rekeyed `local-*` id finds the
    /// row under its server id.
    pub async fn get_local(&self, collection: &str, id: &str) -> Result<Option<LocalEntity>, SyncError> {
        if let Some(entity) = self.local.get(collection, id).await? {
            return Ok(Some(entity));
        }
        match self.local.server_id(collection, id).await? {
            Some(server_id) => Ok(self.local.get(collection, &server_id).await?),
            None => Ok(None),
        }
    }

    /// Local edits of `collection` the backend has not confirmed yet.
    pub async fn unsynced(&self, collection: &str) -> Result<Vec<LocalEntity>, SyncError> {
        Ok(self.local.unsynced(collection).await?)
    }

    /// Drop confirmed local copies untouched for `max_age`. Unsynced rows
    /// are kept. Returns how many rows went.
    pub async fn prune_confirmed(&self, collection: &str, max_age: Duration) -> Result<u64, SyncError> {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        Ok(self.local.prune_synced(collection, cutoff).await?)
    }

    /// Writes the backend rejected or that ran out of retries.
    pub async fn failed_mutations(&self) -> Result<Vec<PendingMutation>, SyncError> {
        Ok(self.queue.failed().await?)
    }

    /// Put a failed mutation back in the queue with a fresh retry budget.
    pub async fn retry_failed(&self, id: i64) -> Result<(), SyncError> {
        if !self.queue.retry_failed(id).await? {
            return Err(SyncError::MutationNotFound(id));
        }
        info!(id, "Failed mutation requeued");
        self.engine.wake();
        Ok(())
    }

    /// Give up on a failed mutation. The local copy of its entity is dropped
    /// (unless later writes to it are still queued) so the remote version
    /// shows again. Discarding a failed create also discards every later
    /// write to that entity.
    pub async fn discard_failed(&self, id: i64) -> Result<PendingMutation, SyncError> {
        let mutation = match self.queue.get(id).await? {
            Some(m) if m.state == MutationState::Failed => m,
            _ => return Err(SyncError::MutationNotFound(id)),
        };
        self.queue.discard(id).await?;

        let collection = mutation.collection.as_str();
        let mut remaining = self.queue.pending_for_entity(collection, &mutation.entity_id).await?;
        if mutation.method == MutationMethod::Create {
            for later in &remaining {
                self.queue.discard(later.id).await?;
            }
            remaining.clear();
        }
        if remaining.is_empty() {
            self.local.delete(collection, &mutation.entity_id).await?;
        }

        self.cache
            .invalidate(Invalidation::Collection(collection.to_string()))
            .await;
        self.engine.wake();
        Ok(mutation)
    }

    /// Run drain passes now, until one makes no progress.
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        Ok(self.engine.drain_all().await?)
    }

    /// Drop cached remote reads; see [`Invalidation::parse`] for the string form.
    pub async fn invalidate(&self, scope: &str) -> usize {
        self.cache.invalidate_str(scope).await
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            state: self.state(),
            online: self.monitor.is_online(),
            remote_failures: self.monitor.failure_count(),
            queue: self.queue.stats().await?,
            cache: self.cache.stats(),
            draining: self.engine.is_draining(),
        })
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
        crate::metrics::set_client_state(&state.to_string());
    }
}

/// Entity an update or delete applies to, and its local row.
///
/// A `local-*` id with no row resolves through the alias left when its
/// create was acknowledged; one without an alias was never stored here.
async fn resolve_target(
    conn: &mut SqliteConnection,
    collection: &str,
    id: String,
) -> Result<(String, Option<LocalEntity>), SyncError> {
    let existing = local::get_on(conn, collection, &id).await?;
    if existing.is_some() || !id.starts_with(LOCAL_ID_PREFIX) {
        return Ok((id, existing));
    }
    match local::alias_on(conn, collection, &id).await? {
        Some(server_id) => {
            let existing = local::get_on(conn, collection, &server_id).await?;
            Ok((server_id, existing))
        }
        None => Err(SyncError::NotFound {
            collection: collection.to_string(),
            id,
        }),
    }
}

/// Row for an entity this device has never stored.
fn blank(collection: &str, id: &str) -> LocalEntity {
    let now = now_millis();
    LocalEntity {
        id: id.to_string(),
        collection: collection.to_string(),
        owner_id: String::new(),
        payload: Value::Object(Default::default()),
        synced: false,
        deleted: false,
        created_at: now,
        local_updated_at: now,
    }
}

fn mutation(method: MutationMethod, entity: &LocalEntity) -> NewMutation {
    let body = match method {
        MutationMethod::Delete => None,
        MutationMethod::Create | MutationMethod::Update => Some(row_body(&entity.owner_id, &entity.payload)),
    };
    NewMutation {
        method,
        collection: entity.collection.clone(),
        entity_id: entity.id.clone(),
        owner_id: entity.owner_id.clone(),
        body,
    }
}
