// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::entity::Record;
use crate::query::CacheKey;

/// Durable local storage failure. Fatal to the write path.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Invalid collection name '{0}'")]
    InvalidCollection(String),
    #[error("Local storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt row '{id}': {reason}")]
    Corruption { id: String, reason: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Cache storage failure. Never surfaced as a read failure.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache storage unavailable")]
    Unavailable,
    #[error("Cache I/O error: {0}")]
    Io(String),
}

/// A cached query result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data: Vec<Record>,
    pub cached_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    /// Insert or replace the entry under `entry.key`.
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;
    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Remove every entry whose key starts with `prefix`. Returns the count removed.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}
