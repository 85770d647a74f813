// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{CacheEntry, CacheError, CacheStore};
use crate::query::CacheKey;

/// Process-local cache storage.
pub struct MemoryCacheStore {
    data: DashMap<CacheKey, CacheEntry>,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether an entry (expired or not) is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.data.contains_key(key)
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.data.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.data.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let before = self.data.len();
        self.data.retain(|key, _| !key.as_str().starts_with(prefix));
        Ok(before.saturating_sub(self.data.len()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use std::time::Duration;
    use tokio::time::Instant;

    fn entry(query: &Query) -> CacheEntry {
        let now = Instant::now();
        CacheEntry {
            key: query.cache_key(),
            data: Vec::new(),
            cached_at: now,
            expires_at: now + Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryCacheStore::new();
        let q = Query::for_owner("tasks", "o1");
        store.put(entry(&q)).await.unwrap();

        let got = store.get(&q.cache_key()).await.unwrap();
        assert!(got.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let store = MemoryCacheStore::new();
        let q = Query::for_owner("tasks", "o1");
        store.put(entry(&q)).await.unwrap();
        store.put(entry(&q)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_nonexistent_is_ok() {
        let store = MemoryCacheStore::new();
        let key = Query::new("tasks").cache_key();
        assert!(store.remove(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_prefix_only_touches_collection() {
        let store = MemoryCacheStore::new();
        store.put(entry(&Query::for_owner("tasks", "o1"))).await.unwrap();
        store.put(entry(&Query::for_owner("tasks", "o2"))).await.unwrap();
        store.put(entry(&Query::for_owner("tasks_archive", "o1"))).await.unwrap();
        store.put(entry(&Query::for_owner("logs", "o1"))).await.unwrap();

        let removed = store.remove_prefix(&CacheKey::prefix_for("tasks")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 2);
        assert!(store.contains(&Query::for_owner("tasks_archive", "o1").cache_key()));
        assert!(store.contains(&Query::for_owner("logs", "o1").cache_key()));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryCacheStore::new();
        for owner in ["a", "b", "c"] {
            store.put(entry(&Query::for_owner("tasks", owner))).await.unwrap();
        }
        store.clear().await.unwrap();
        assert!(store.is_empty());
    }
}
