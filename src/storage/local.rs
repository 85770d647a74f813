// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed local store.
//!
//! Durable, process-private storage of entities tagged with sync metadata.
//! One table per collection, created on first use:
//!
//! ```sql
//! CREATE TABLE entity_<collection> (
//!   id TEXT PRIMARY KEY,
//!   owner_id TEXT NOT NULL,
//!   payload TEXT NOT NULL,          -- JSON
//!   synced INTEGER NOT NULL,        -- 0 = local write not yet confirmed
//!   deleted INTEGER NOT NULL,       -- tombstone for an unconfirmed delete
//!   created_at INTEGER NOT NULL,
//!   local_updated_at INTEGER NOT NULL
//! );
//! -- + indexes on owner_id and synced
//!
//! CREATE TABLE entity_aliases (      -- local id -> server id, kept after a create is acked
//!   collection TEXT NOT NULL,
//!   local_id TEXT NOT NULL,
//!   server_id TEXT NOT NULL,
//!   PRIMARY KEY (collection, local_id)
//! );
//! ```
//!
//! The pending mutation queue lives in the same file and shares the pool,
//! so an optimistic write and its enqueue commit in one transaction.
//! Write transactions start with `BEGIN IMMEDIATE` ([`LocalStore::begin_write`]).

use dashmap::DashSet;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::StorageError;
use crate::entity::{now_millis, LocalEntity};
use crate::query::is_valid_collection;
use crate::resilience::retry::{retry, RetryConfig};

/// Whether a write reflects an unconfirmed local edit or a backend-confirmed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Optimistic local edit; row becomes `synced = false`
    Local,
    /// Backend has confirmed this state; row becomes `synced = true`
    Confirmed,
}

pub struct LocalStore {
    pool: SqlitePool,
    /// Where the store lives (for display)
    location: String,
    /// Collections whose table is known to exist
    tables: DashSet<String>,
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let location = path.as_ref().to_string_lossy().to_string();
        info!(path = %location, "Opening local store");

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            }
        })
        .await?;

        init_schema(&pool).await?;
        Ok(Self::from_pool(pool, location))
    }

    /// Non-durable store for tests and server-side use.
    ///
    /// Pinned to a single connection: every connection to `:memory:` is a
    /// separate database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        init_schema(&pool).await?;
        Ok(Self::from_pool(pool, ":memory:".to_string()))
    }

    fn from_pool(pool: SqlitePool, location: String) -> Self {
        Self {
            pool,
            location,
            tables: DashSet::new(),
        }
    }

    /// Connection pool shared with the mutation queue.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Start a transaction that holds the database write lock from its first
    /// statement.
    ///
    /// A deferred transaction that reads before it writes cannot wait for the
    /// lock: if another connection commits in between, the upgrade fails at
    /// once with `SQLITE_BUSY`. Taking the lock up front lets `busy_timeout`
    /// queue concurrent writers instead.
    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Create the table and indexes for `collection` if they don't exist yet.
    pub async fn ensure_collection(&self, collection: &str) -> Result<(), StorageError> {
        let table = table_name(collection)?;
        if self.tables.contains(collection) {
            return Ok(());
        }

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0,
                    deleted INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    local_updated_at INTEGER NOT NULL
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table} (owner_id)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table} (synced)"),
        ];
        for sql in &statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        self.tables.insert(collection.to_string());
        debug!(collection, "Local collection table ready");
        Ok(())
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<LocalEntity>, StorageError> {
        self.ensure_collection(collection).await?;
        let mut conn = self.pool.acquire().await?;
        get_on(&mut conn, collection, id).await
    }

    /// Every row of `collection` owned by `owner_id`, tombstones included.
    pub async fn get_by_owner(&self, collection: &str, owner_id: &str) -> Result<Vec<LocalEntity>, StorageError> {
        let table = table_name(collection)?;
        self.ensure_collection(collection).await?;
        let rows = sqlx::query(&format!(
            "SELECT id, owner_id, payload, synced, deleted, created_at, local_updated_at
             FROM {table} WHERE owner_id = ? ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| decode_row(collection, row)).collect()
    }

    /// Rows whose latest local write is not yet confirmed.
    pub async fn unsynced(&self, collection: &str) -> Result<Vec<LocalEntity>, StorageError> {
        let table = table_name(collection)?;
        self.ensure_collection(collection).await?;
        let rows = sqlx::query(&format!(
            "SELECT id, owner_id, payload, synced, deleted, created_at, local_updated_at
             FROM {table} WHERE synced = 0 ORDER BY local_updated_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| decode_row(collection, row)).collect()
    }

    /// Server id a rekeyed local id now lives under.
    pub async fn server_id(&self, collection: &str, local_id: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        alias_on(&mut conn, collection, local_id).await
    }

    /// Insert or replace an entity.
    ///
    /// A local write stamps `local_updated_at = now`; a confirmed write keeps
    /// the entity's own value (the server's `updated_at`). `synced` follows `origin`.
    /// Returns the row as stored.
    pub async fn put(&self, entity: &LocalEntity, origin: WriteOrigin) -> Result<LocalEntity, StorageError> {
        self.ensure_collection(&entity.collection).await?;
        let mut conn = self.pool.acquire().await?;
        put_on(&mut conn, entity, origin).await
    }

    /// Remove a row. Returns whether it existed.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        self.ensure_collection(collection).await?;
        let mut conn = self.pool.acquire().await?;
        delete_on(&mut conn, collection, id).await
    }

    /// Evict confirmed rows not written locally since `older_than` (epoch millis).
    ///
    /// Unsynced rows are never evicted.
    pub async fn prune_synced(&self, collection: &str, older_than: i64) -> Result<u64, StorageError> {
        let table = table_name(collection)?;
        self.ensure_collection(collection).await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE synced = 1 AND local_updated_at < ?"
        ))
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            info!(collection, pruned, "Pruned confirmed local entities");
        }
        Ok(pruned)
    }

    pub async fn count(&self, collection: &str) -> Result<u64, StorageError> {
        let table = table_name(collection)?;
        self.ensure_collection(collection).await?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("cnt")?;
        Ok(count as u64)
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS entity_aliases (
            collection TEXT NOT NULL,
            local_id TEXT NOT NULL,
            server_id TEXT NOT NULL,
            PRIMARY KEY (collection, local_id)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn table_name(collection: &str) -> Result<String, StorageError> {
    if is_valid_collection(collection) {
        Ok(format!("entity_{}", collection))
    } else {
        Err(StorageError::InvalidCollection(collection.to_string()))
    }
}

fn decode_row(collection: &str, row: &SqliteRow) -> Result<LocalEntity, StorageError> {
    let id: String = row.try_get("id")?;
    let payload_text: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_text).map_err(|e| {
        crate::metrics::record_corruption(collection);
        StorageError::Corruption {
            id: id.clone(),
            reason: e.to_string(),
        }
    })?;

    Ok(LocalEntity {
        collection: collection.to_string(),
        owner_id: row.try_get("owner_id")?,
        payload,
        synced: row.try_get::<i64, _>("synced")? != 0,
        deleted: row.try_get::<i64, _>("deleted")? != 0,
        created_at: row.try_get("created_at")?,
        local_updated_at: row.try_get("local_updated_at")?,
        id,
    })
}

// Connection-level operations, usable inside a caller's transaction.
// The collection table must already exist.

pub(crate) async fn get_on(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
) -> Result<Option<LocalEntity>, StorageError> {
    let table = table_name(collection)?;
    let row = sqlx::query(&format!(
        "SELECT id, owner_id, payload, synced, deleted, created_at, local_updated_at
         FROM {table} WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(|r| decode_row(collection, r)).transpose()
}

pub(crate) async fn put_on(
    conn: &mut SqliteConnection,
    entity: &LocalEntity,
    origin: WriteOrigin,
) -> Result<LocalEntity, StorageError> {
    let table = table_name(&entity.collection)?;
    let mut stored = entity.clone();
    stored.synced = origin == WriteOrigin::Confirmed;
    if origin == WriteOrigin::Local {
        stored.local_updated_at = now_millis();
    }

    let payload = serde_json::to_string(&stored.payload)
        .map_err(|e| StorageError::Backend(format!("payload encode failed: {}", e)))?;

    sqlx::query(&format!(
        "INSERT INTO {table} (id, owner_id, payload, synced, deleted, created_at, local_updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            owner_id = excluded.owner_id,
            payload = excluded.payload,
            synced = excluded.synced,
            deleted = excluded.deleted,
            created_at = excluded.created_at,
            local_updated_at = excluded.local_updated_at"
    ))
    .bind(&stored.id)
    .bind(&stored.owner_id)
    .bind(&payload)
    .bind(stored.synced as i64)
    .bind(stored.deleted as i64)
    .bind(stored.created_at)
    .bind(stored.local_updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(stored)
}

pub(crate) async fn rekey_on(
    conn: &mut SqliteConnection,
    collection: &str,
    old_id: &str,
    new_id: &str,
) -> Result<bool, StorageError> {
    let table = table_name(collection)?;
    sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
        .bind(new_id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query(&format!("UPDATE {table} SET id = ? WHERE id = ?"))
        .bind(new_id)
        .bind(old_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "INSERT INTO entity_aliases (collection, local_id, server_id) VALUES (?, ?, ?)
         ON CONFLICT(collection, local_id) DO UPDATE SET server_id = excluded.server_id",
    )
    .bind(collection)
    .bind(old_id)
    .bind(new_id)
    .execute(&mut *conn)
    .await?;

    debug!(collection, old_id, new_id, "Rekeyed local entity");
    Ok(result.rows_affected() > 0)
}

/// Server id a rekeyed local id now lives under.
pub(crate) async fn alias_on(
    conn: &mut SqliteConnection,
    collection: &str,
    local_id: &str,
) -> Result<Option<String>, StorageError> {
    let row = sqlx::query("SELECT server_id FROM entity_aliases WHERE collection = ? AND local_id = ?")
        .bind(collection)
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.try_get("server_id")).transpose()?)
}

pub(crate) async fn delete_on(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
) -> Result<bool, StorageError> {
    let table = table_name(collection)?;
    let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
