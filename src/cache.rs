// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-through TTL cache in front of the remote backend.
//!
//! # Flow
//!
//! ```text
//! get(query)
//!     │
//!     ├─→ collection not cacheable / non-interactive ──→ remote (Source::Network)
//!     │
//!     ├─→ entry present and now < expires_at ──────────→ Source::Cache
//!     │
//!     └─→ miss / expired / force_refresh
//!             │
//!             ▼
//!         remote.list(query)
//!             │
//!             ├─→ generation unchanged → store entry
//!             └─→ invalidated meanwhile → return rows, don't store
//! ```
//!
//! Cache storage is best-effort: a failing [`CacheStore`] degrades to
//! network reads, it never fails a read.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::entity::Record;
use crate::query::{CacheKey, Query, KEY_SEPARATOR};
use crate::remote::{RemoteDataSource, RemoteError};
use crate::resilience::health::ConnectivityMonitor;
use crate::storage::traits::{CacheEntry, CacheStore};

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Skip the cache lookup and replace the entry with a fresh result
    pub force_refresh: bool,
}

impl GetOptions {
    #[must_use]
    pub fn refresh() -> Self {
        Self { force_refresh: true }
    }
}

/// Scope of a cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    All,
    Collection(String),
    Key(CacheKey),
}

impl Invalidation {
    /// `*` is everything, a string with the key separator names one key, and
    /// anything else is a collection.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            return Self::All;
        }
        if raw.contains(KEY_SEPARATOR) {
            if let Some(key) = CacheKey::parse(raw) {
                return Self::Key(key);
            }
            // Malformed key: fall back to the widest scope its prefix names
            let collection = raw.split(KEY_SEPARATOR).next().unwrap_or_default();
            return Self::Collection(collection.to_string());
        }
        Self::Collection(raw.to_string())
    }

    fn label(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Collection(_) => "collection",
            Self::Key(_) => "key",
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Reads that skipped the cache entirely
    pub bypasses: u64,
    pub invalidations: u64,
    /// Hit rate over cacheable reads (0.0 - 1.0)
    pub hit_rate: f64,
}

pub struct ReadCache {
    store: Arc<dyn CacheStore>,
    remote: Arc<dyn RemoteDataSource>,
    /// Cacheable collections and their TTL
    ttls: HashMap<String, Duration>,
    /// Non-interactive processes never cache
    interactive: bool,
    monitor: Arc<ConnectivityMonitor>,
    /// Bumped by every invalidation touching a collection
    generations: DashMap<String, u64>,
    /// Bumped by `Invalidation::All`
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    invalidations: AtomicU64,
}

impl ReadCache {
    pub fn new(
        remote: Arc<dyn RemoteDataSource>,
        store: Arc<dyn CacheStore>,
        config: &SyncConfig,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        let ttls = config
            .cacheable
            .keys()
            .filter_map(|c| config.ttl_for(c).map(|ttl| (c.clone(), ttl)))
            .collect();

        Self {
            store,
            remote,
            ttls,
            interactive: config.interactive,
            monitor,
            generations: DashMap::new(),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// TTL for `collection`, or `None` if reads of it bypass the cache.
    #[must_use]
    pub fn ttl_for(&self, collection: &str) -> Option<Duration> {
        if !self.interactive {
            return None;
        }
        self.ttls.get(collection).copied()
    }

    /// Read `query`, from the cache when a live entry exists.
    ///
    /// A remote failure on a miss is returned as-is; expired entries are
    /// never served as a fallback.
    pub async fn get(&self, query: &Query, options: GetOptions) -> Result<(Vec<Record>, Source), RemoteError> {
        let collection = query.collection.as_str();
        let Some(ttl) = self.ttl_for(collection) else {
            self.bypasses.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_lookup(collection, "bypass");
            let rows = self.fetch(query).await?;
            return Ok((rows, Source::Network));
        };

        let key = query.cache_key();

        if !options.force_refresh {
            match self.store.get(&key).await {
                Ok(Some(entry)) if !entry.is_expired(Instant::now()) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_lookup(collection, "hit");
                    debug!(key = %key, rows = entry.data.len(), "Cache hit");
                    return Ok((entry.data, Source::Cache));
                }
                Ok(Some(_)) => {
                    debug!(key = %key, "Cache entry expired");
                    if let Err(e) = self.store.remove(&key).await {
                        warn!(key = %key, error = %e, "Failed to drop expired cache entry");
                        crate::metrics::record_cache_error("remove");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Cache read failed, falling back to network");
                    crate::metrics::record_cache_error("get");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(collection, "miss");

        let generation = self.generation(collection);
        let rows = self.fetch(query).await?;

        if self.generation(collection) != generation {
            // A write landed while the request was in flight; its result may
            // predate that write.
            debug!(key = %key, "Collection invalidated during fetch, not caching");
            return Ok((rows, Source::Network));
        }

        let now = Instant::now();
        let entry = CacheEntry {
            key: key.clone(),
            data: rows.clone(),
            cached_at: now,
            expires_at: now + ttl,
        };
        if let Err(e) = self.store.put(entry).await {
            warn!(key = %key, error = %e, "Cache write failed");
            crate::metrics::record_cache_error("put");
        }

        Ok((rows, Source::Network))
    }

    /// Drop cached entries in `scope`. Returns the number of entries removed.
    ///
    /// Also stops any read already in flight for that scope from storing
    /// its result.
    pub async fn invalidate(&self, scope: Invalidation) -> usize {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let label = scope.label();

        let result = match &scope {
            Invalidation::All => {
                self.epoch.fetch_add(1, Ordering::AcqRel);
                self.store.clear().await.map(|_| 0)
            }
            Invalidation::Collection(collection) => {
                self.bump(collection);
                self.store.remove_prefix(&CacheKey::prefix_for(collection)).await
            }
            Invalidation::Key(key) => {
                self.bump(key.collection());
                self.store.remove(key).await.map(|_| 1)
            }
        };

        match result {
            Ok(removed) => {
                debug!(scope = ?scope, removed, "Cache invalidated");
                crate::metrics::record_cache_invalidation(label, removed);
                removed
            }
            Err(e) => {
                warn!(scope = ?scope, error = %e, "Cache invalidation failed");
                crate::metrics::record_cache_error("invalidate");
                0
            }
        }
    }

    /// String form of [`invalidate`](Self::invalidate); see [`Invalidation::parse`].
    pub async fn invalidate_str(&self, scope: &str) -> usize {
        self.invalidate(Invalidation::parse(scope)).await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            bypasses: self.bypasses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    async fn fetch(&self, query: &Query) -> Result<Vec<Record>, RemoteError> {
        match self.remote.list(query).await {
            Ok(rows) => {
                self.monitor.record_success();
                crate::metrics::record_remote_call("list", "ok");
                Ok(rows)
            }
            Err(e) => {
                if e.is_transient() {
                    self.monitor.record_failure();
                    crate::metrics::record_remote_call("list", "transient");
                } else {
                    self.monitor.record_success();
                    crate::metrics::record_remote_call("list", "rejected");
                }
                Err(e)
            }
        }
    }

    fn generation(&self, collection: &str) -> (u64, u64) {
        let per_collection = self.generations.get(collection).map(|g| *g).unwrap_or(0);
        (self.epoch.load(Ordering::Acquire), per_collection)
    }

    fn bump(&self, collection: &str) {
        *self.generations.entry(collection.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{InMemoryRemote, RemoteOp};
    use crate::storage::memory::MemoryCacheStore;
    use crate::storage::traits::CacheError;
    use async_trait::async_trait;
    use serde_json::json;

    fn config(collections: &[&str]) -> SyncConfig {
        SyncConfig {
            cacheable: collections.iter().map(|c| (c.to_string(), None)).collect(),
            ..Default::default()
        }
    }

    fn seeded_remote() -> Arc<InMemoryRemote> {
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed(
            "tasks",
            Record {
                id: "srv-1".into(),
                owner_id: "o1".into(),
                created_at: 1,
                updated_at: 1,
                payload: json!({"title": "walk"}),
            },
        );
        remote
    }

    fn cache(remote: Arc<InMemoryRemote>, store: Arc<dyn CacheStore>, config: &SyncConfig) -> ReadCache {
        ReadCache::new(remote, store, config, Arc::new(ConnectivityMonitor::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expiry() {
        let remote = seeded_remote();
        let cache = cache(remote.clone(), Arc::new(MemoryCacheStore::new()), &config(&["tasks"]));
        let query = Query::for_owner("tasks", "o1");

        let (rows, source) = cache.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Network);
        assert_eq!(rows.len(), 1);

        let (_, source) = cache.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Cache);
        assert_eq!(remote.count_calls(RemoteOp::List), 1);

        tokio::time::advance(Duration::from_secs(299)).await;
        let (_, source) = cache.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Cache);

        // now == expires_at is already expired
        tokio::time::advance(Duration::from_secs(1)).await;
        let (_, source) = cache.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Network);
        assert_eq!(remote.count_calls(RemoteOp::List), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_override() {
        let remote = seeded_remote();
        let mut cfg = config(&[]);
        cfg.cacheable.insert("tasks".into(), Some(10));
        let cache = cache(remote.clone(), Arc::new(MemoryCacheStore::new()), &cfg);
        let query = Query::new("tasks");

        cache.get(&query, GetOptions::default()).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let (_, source) = cache.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Network);
    }

    #[tokio::test]
    async fn test_force_refresh_replaces_entry() {
        let remote = seeded_remote();
        let cache = cache(remote.clone(), Arc::new(MemoryCacheStore::new()), &config(&["tasks"]));
        let query = Query::new("tasks");

        cache.get(&query, GetOptions::default()).await.unwrap();
        remote.insert("tasks", &json!({"owner_id": "o1"})).await.unwrap();

        let (rows, source) = cache.get(&query, GetOptions::refresh()).await.unwrap();
        assert_eq!(source, Source::Network);
        assert_eq!(rows.len(), 2);

        let (rows, source) = cache.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Cache);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_non_cacheable_and_non_interactive_bypass() {
        let remote = seeded_remote();
        let cache_a = cache(remote.clone(), Arc::new(MemoryCacheStore::new()), &config(&["logs"]));
        let query = Query::new("tasks");

        for _ in 0..2 {
            let (_, source) = cache_a.get(&query, GetOptions::default()).await.unwrap();
            assert_eq!(source, Source::Network);
        }
        assert_eq!(cache_a.stats().bypasses, 2);

        let mut cfg = config(&["tasks"]);
        cfg.interactive = false;
        let cache_b = cache(remote.clone(), Arc::new(MemoryCacheStore::new()), &cfg);
        cache_b.get(&query, GetOptions::default()).await.unwrap();
        let (_, source) = cache_b.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Network);
        assert_eq!(remote.count_calls(RemoteOp::List), 4);
    }

    #[tokio::test]
    async fn test_invalidation_scopes() {
        let remote = seeded_remote();
        let store = Arc::new(MemoryCacheStore::new());
        let cache = cache(remote.clone(), store.clone(), &config(&["tasks", "logs"]));

        let tasks_o1 = Query::for_owner("tasks", "o1");
        let tasks_o2 = Query::for_owner("tasks", "o2");
        let logs = Query::for_owner("logs", "o1");
        for q in [&tasks_o1, &tasks_o2, &logs] {
            cache.get(q, GetOptions::default()).await.unwrap();
        }
        assert_eq!(store.len(), 3);

        // Single key
        cache.invalidate(Invalidation::Key(tasks_o1.cache_key())).await;
        assert!(!store.contains(&tasks_o1.cache_key()));
        assert!(store.contains(&tasks_o2.cache_key()));

        // Whole collection, string form
        cache.get(&tasks_o1, GetOptions::default()).await.unwrap();
        assert_eq!(cache.invalidate_str("tasks").await, 2);
        assert!(store.contains(&logs.cache_key()));

        cache.invalidate(Invalidation::All).await;
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalidation_parse() {
        let key = Query::new("tasks").cache_key();
        assert_eq!(Invalidation::parse(key.as_str()), Invalidation::Key(key));
        assert_eq!(Invalidation::parse("tasks"), Invalidation::Collection("tasks".into()));
        assert_eq!(Invalidation::parse("tasks:"), Invalidation::Collection("tasks".into()));
        assert_eq!(Invalidation::parse("*"), Invalidation::All);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_read_not_cached_after_invalidation() {
        let remote = seeded_remote();
        remote.set_latency(Some(Duration::from_millis(100)));
        let store = Arc::new(MemoryCacheStore::new());
        let cache = Arc::new(cache(remote.clone(), store.clone(), &config(&["tasks"])));
        let query = Query::new("tasks");

        let reader = {
            let cache = cache.clone();
            let query = query.clone();
            tokio::spawn(async move { cache.get(&query, GetOptions::default()).await })
        };
        // Let the read reach the remote
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        cache.invalidate(Invalidation::Collection("tasks".into())).await;

        let (rows, source) = reader.await.unwrap().unwrap();
        assert_eq!(source, Source::Network);
        assert_eq!(rows.len(), 1);
        assert!(!store.contains(&query.cache_key()));
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable)
        }
        async fn put(&self, _: CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::Io("disk full".into()))
        }
        async fn remove(&self, _: &CacheKey) -> Result<(), CacheError> {
            Err(CacheError::Unavailable)
        }
        async fn remove_prefix(&self, _: &str) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable)
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable)
        }
    }

    #[tokio::test]
    async fn test_cache_errors_are_swallowed() {
        let remote = seeded_remote();
        let cache = cache(remote.clone(), Arc::new(BrokenStore), &config(&["tasks"]));
        let query = Query::new("tasks");

        let (rows, source) = cache.get(&query, GetOptions::default()).await.unwrap();
        assert_eq!(source, Source::Network);
        assert_eq!(rows.len(), 1);
        assert_eq!(cache.invalidate_str("tasks").await, 0);
    }

    #[tokio::test]
    async fn test_remote_error_propagates_on_miss() {
        let remote = seeded_remote();
        let cache = cache(remote.clone(), Arc::new(MemoryCacheStore::new()), &config(&["tasks"]));
        remote.set_offline(true);

        let err = cache.get(&Query::new("tasks"), GetOptions::default()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_stats() {
        let remote = seeded_remote();
        let cache = cache(remote, Arc::new(MemoryCacheStore::new()), &config(&["tasks"]));
        let query = Query::new("tasks");

        cache.get(&query, GetOptions::default()).await.unwrap();
        cache.get(&query, GetOptions::default()).await.unwrap();
        cache.get(&query, GetOptions::default()).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
