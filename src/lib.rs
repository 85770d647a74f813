//! # Care Sync
//!
//! Client-side data layer for a health-tracking app: a read-through cache in
//! front of the remote backend, plus offline-first writes replayed in order
//! once connectivity returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SyncClient                          │
//! │  • write(): local store + mutation queue, one transaction  │
//! │  • merged_view(): remote ⊕ local, ordered newest first     │
//! └─────────────────────────────────────────────────────────────┘
//!            │ reads                          │ writes
//!            ▼                                ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │        ReadCache          │   │  LocalStore + Mutation    │
//! │  • TTL per collection     │   │  Queue (SQLite)           │
//! │  • invalidated on writes  │   │  • local-* ids            │
//! └───────────────────────────┘   │  • FIFO replay order      │
//!            │                    └───────────────────────────┘
//!            │                                │
//!            │                      (SyncEngine drain loop)
//!            ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 RemoteDataSource (authoritative)            │
//! │  • HttpRemote (REST)  • InMemoryRemote (tests, demos)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use care_sync::{HttpRemote, SyncClient, SyncConfig, WriteRequest};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), care_sync::SyncError> {
//!     let config = SyncConfig {
//!         db_path: Some("care-sync.db".into()),
//!         ..Default::default()
//!     };
//!     let remote = HttpRemote::new("https://api.example.com", "anon-key", config.remote_timeout())?
//!         .with_access_token("session-jwt");
//!     let client = SyncClient::open(config, Arc::new(remote)).await?;
//!     client.start();
//!
//!     // Works offline: the task is visible immediately with a local id
//!     client
//!         .write("tasks", WriteRequest::create("patient-7", json!({"title": "Walk 20 min"})))
//!         .await?;
//!
//!     for task in client.merged_view("tasks", "patient-7").await?.entities {
//!         println!("{} {:?} {}", task.id, task.sync_state, task.payload);
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`SyncClient`] and the background [`SyncEngine`]
//! - [`cache`]: TTL read cache with scoped invalidation
//! - [`queue`]: durable FIFO of pending mutations
//! - [`reconcile`]: merged view of remote and local state
//! - [`remote`]: backend trait, REST client, in-memory fake
//! - [`storage`]: SQLite local store and cache storage
//! - [`resilience`]: backoff policy and connectivity tracking

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod query;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod resilience;
pub mod storage;

pub use cache::{CacheStats, GetOptions, Invalidation, ReadCache, Source};
pub use config::SyncConfig;
pub use coordinator::{ClientState, DrainReport, SyncClient, SyncEngine, SyncStatus, WriteRequest};
pub use entity::{LocalEntity, MergedEntity, Origin, Record, SyncState};
pub use error::SyncError;
pub use query::{CacheKey, Query};
pub use queue::{MutationMethod, MutationQueue, MutationState, PendingMutation, QueueStats};
pub use reconcile::MergedView;
pub use remote::http::HttpRemote;
pub use remote::memory::InMemoryRemote;
pub use remote::{RemoteDataSource, RemoteError};
pub use resilience::retry::RetryConfig;
pub use storage::local::LocalStore;
pub use storage::traits::{CacheStore, StorageError};
pub use metrics::LatencyTimer;
