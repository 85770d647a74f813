// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable FIFO queue of writes the backend has not acknowledged yet.
//!
//! Lives in the local store's SQLite file and shares its pool:
//!
//! ```sql
//! CREATE TABLE pending_mutations (
//!   seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- FIFO order, never reused
//!   method TEXT NOT NULL,                   -- create | update | delete
//!   collection TEXT NOT NULL,
//!   entity_id TEXT NOT NULL,
//!   endpoint TEXT NOT NULL,
//!   body TEXT,                              -- JSON row body
//!   owner_id TEXT NOT NULL,
//!   enqueued_at INTEGER NOT NULL,
//!   retries INTEGER NOT NULL DEFAULT 0,
//!   next_attempt_at INTEGER NOT NULL,
//!   state TEXT NOT NULL,                    -- queued | in_flight | failed
//!   last_error TEXT
//! );
//! ```
//!
//! A mutation leaves the table only on [`ack`](MutationQueue::ack) or an
//! explicit [`discard`](MutationQueue::discard). Rows left `in_flight` by a
//! crash go back to `queued` on open; the backend may then see that write
//! twice.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::entity::now_millis;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationMethod {
    Create,
    Update,
    Delete,
}

impl MutationMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// HTTP verb the backend expects.
    #[must_use]
    pub fn http_verb(self) -> &'static str {
        match self {
            Self::Create => "POST",
            Self::Update => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for MutationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown mutation method '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Queued,
    InFlight,
    /// Rejected or out of retries; waits for `retry_failed` or `discard`
    Failed,
}

impl MutationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for MutationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown mutation state '{}'", other)),
        }
    }
}

/// A write waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Monotonic; defines replay order
    pub id: i64,
    pub method: MutationMethod,
    pub collection: String,
    /// Target entity (`local-*` for a create until it is acknowledged)
    pub entity_id: String,
    /// Backend endpoint, e.g. `/rest/v1/tasks?id=eq.srv-9`
    pub endpoint: String,
    /// Row body for create/update
    pub body: Option<Value>,
    pub owner_id: String,
    pub enqueued_at: i64,
    /// Transient failures so far
    pub retries: u32,
    /// Not attempted before this time (epoch millis)
    pub next_attempt_at: i64,
    pub state: MutationState,
    pub last_error: Option<String>,
}

/// A mutation about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub method: MutationMethod,
    pub collection: String,
    pub entity_id: String,
    pub owner_id: String,
    pub body: Option<Value>,
}

impl NewMutation {
    /// Backend endpoint this mutation targets.
    #[must_use]
    pub fn endpoint(&self) -> String {
        endpoint_for(self.method, &self.collection, &self.entity_id)
    }
}

fn endpoint_for(method: MutationMethod, collection: &str, entity_id: &str) -> String {
    match method {
        MutationMethod::Create => format!("/rest/v1/{}", collection),
        MutationMethod::Update | MutationMethod::Delete => {
            format!("/rest/v1/{}?id=eq.{}", collection, entity_id)
        }
    }
}

/// Queue state for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub in_flight: u64,
    pub failed: u64,
    /// Enqueue time of the oldest unacknowledged mutation
    pub oldest_enqueued_at: Option<i64>,
}

impl QueueStats {
    /// Mutations still expected to reach the backend without intervention.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.queued + self.in_flight
    }
}

const COLUMNS: &str = "seq, method, collection, entity_id, endpoint, body, owner_id, \
                       enqueued_at, retries, next_attempt_at, state, last_error";

pub struct MutationQueue {
    pool: SqlitePool,
}

impl MutationQueue {
    /// Create the queue table if needed and recover rows a crash left in flight.
    pub async fn open(pool: SqlitePool) -> Result<Self, StorageError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS pending_mutations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT NOT NULL,
                collection TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                body TEXT,
                owner_id TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_pending_mutations_enqueued ON pending_mutations (enqueued_at)",
            "CREATE INDEX IF NOT EXISTS idx_pending_mutations_owner ON pending_mutations (owner_id)",
            "CREATE INDEX IF NOT EXISTS idx_pending_mutations_entity ON pending_mutations (collection, entity_id)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&pool).await?;
        }

        let recovered = sqlx::query(
            "UPDATE pending_mutations SET state = 'queued' WHERE state = 'in_flight'",
        )
        .execute(&pool)
        .await?
        .rows_affected();
        if recovered > 0 {
            warn!(recovered, "Mutations were in flight at shutdown, requeued");
        }

        let queue = Self { pool };
        let stats = queue.stats().await?;
        if stats.pending() > 0 {
            info!(pending = stats.pending(), failed = stats.failed, "Mutation queue has items from previous run");
        }
        Ok(queue)
    }

    /// Append a mutation. Returns its id.
    pub async fn enqueue(&self, mutation: &NewMutation) -> Result<i64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        enqueue_on(&mut conn, mutation).await
    }

    /// Up to `max` oldest queued mutations, in FIFO order. Nothing is removed.
    pub async fn dequeue_batch(&self, max: usize) -> Result<Vec<PendingMutation>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM pending_mutations WHERE state = 'queued' ORDER BY seq ASC LIMIT ?"
        ))
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_row).collect()
    }

    /// Remove an acknowledged mutation. Acking an unknown id is a no-op.
    pub async fn ack(&self, id: i64) -> Result<bool, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ack_on(&mut conn, id).await
    }

    /// Record a transient failure and schedule the next attempt.
    /// Returns the new retry count, or `None` if the mutation is gone.
    pub async fn bump_retry(&self, id: i64, next_attempt_at: i64, error: &str) -> Result<Option<u32>, StorageError> {
        let row = sqlx::query(
            "UPDATE pending_mutations
             SET retries = retries + 1, next_attempt_at = ?, state = 'queued', last_error = ?
             WHERE seq = ?
             RETURNING retries",
        )
        .bind(next_attempt_at)
        .bind(error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get::<i64, _>("retries").map(|n| n as u32))
            .transpose()
            .map_err(StorageError::from)
    }

    pub async fn mark_in_flight(&self, id: i64) -> Result<bool, StorageError> {
        self.set_state(id, MutationState::InFlight, None).await
    }

    /// Put an in-flight mutation back in line without counting an attempt.
    pub async fn requeue(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE pending_mutations SET state = 'queued' WHERE seq = ? AND state = 'in_flight'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Park a mutation until someone retries or discards it.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<bool, StorageError> {
        self.set_state(id, MutationState::Failed, Some(error)).await
    }

    /// Put a failed mutation back in line with a fresh retry budget.
    pub async fn retry_failed(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE pending_mutations
             SET state = 'queued', retries = 0, next_attempt_at = ?, last_error = NULL
             WHERE seq = ? AND state = 'failed'",
        )
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop a mutation without replaying it. Returns what was removed.
    pub async fn discard(&self, id: i64) -> Result<Option<PendingMutation>, StorageError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM pending_mutations WHERE seq = ?"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mutation = decode_row(&row)?;
        ack_on(&mut tx, id).await?;
        tx.commit().await?;

        info!(id, entity_id = %mutation.entity_id, method = mutation.method.as_str(), "Discarded mutation");
        Ok(Some(mutation))
    }

    pub async fn get(&self, id: i64) -> Result<Option<PendingMutation>, StorageError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM pending_mutations WHERE seq = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Mutations that need manual resolution, oldest first.
    pub async fn failed(&self) -> Result<Vec<PendingMutation>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM pending_mutations WHERE state = 'failed' ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Ids of `collection` entities with a failed mutation.
    pub async fn failed_entities(&self, collection: &str) -> Result<HashSet<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT DISTINCT entity_id FROM pending_mutations WHERE collection = ? AND state = 'failed'",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("entity_id").map_err(StorageError::from))
            .collect()
    }

    /// Every mutation of one entity still in the table, in replay order.
    pub async fn pending_for_entity(&self, collection: &str, entity_id: &str) -> Result<Vec<PendingMutation>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        pending_for_entity_on(&mut conn, collection, entity_id).await
    }

    /// Whole queue in replay order.
    pub async fn list(&self) -> Result<Vec<PendingMutation>, StorageError> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM pending_mutations ORDER BY seq ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Unacknowledged, non-failed mutations.
    pub async fn len(&self) -> Result<u64, StorageError> {
        Ok(self.stats().await?.pending())
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    pub async fn stats(&self) -> Result<QueueStats, StorageError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(state = 'queued'), 0) AS queued,
                COALESCE(SUM(state = 'in_flight'), 0) AS in_flight,
                COALESCE(SUM(state = 'failed'), 0) AS failed,
                MIN(enqueued_at) AS oldest
             FROM pending_mutations",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            queued: row.try_get::<i64, _>("queued")? as u64,
            in_flight: row.try_get::<i64, _>("in_flight")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            oldest_enqueued_at: row.try_get("oldest")?,
        })
    }

    async fn set_state(&self, id: i64, state: MutationState, error: Option<&str>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE pending_mutations SET state = ?, last_error = COALESCE(?, last_error) WHERE seq = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// Connection-level operations, usable inside a caller's transaction.

pub(crate) async fn enqueue_on(conn: &mut SqliteConnection, mutation: &NewMutation) -> Result<i64, StorageError> {
    let body = mutation
        .body
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::Backend(format!("mutation body encode failed: {}", e)))?;
    let now = now_millis();

    let result = sqlx::query(
        "INSERT INTO pending_mutations
            (method, collection, entity_id, endpoint, body, owner_id, enqueued_at, retries, next_attempt_at, state)
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 'queued')",
    )
    .bind(mutation.method.as_str())
    .bind(&mutation.collection)
    .bind(&mutation.entity_id)
    .bind(mutation.endpoint())
    .bind(body)
    .bind(&mutation.owner_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    debug!(
        id,
        method = mutation.method.as_str(),
        collection = %mutation.collection,
        entity_id = %mutation.entity_id,
        "Mutation enqueued"
    );
    Ok(id)
}

pub(crate) async fn ack_on(conn: &mut SqliteConnection, id: i64) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM pending_mutations WHERE seq = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn pending_for_entity_on(
    conn: &mut SqliteConnection,
    collection: &str,
    entity_id: &str,
) -> Result<Vec<PendingMutation>, StorageError> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM pending_mutations
         WHERE collection = ? AND entity_id = ? ORDER BY seq ASC"
    ))
    .bind(collection)
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode_row).collect()
}

pub(crate) async fn remap_entity_on(
    conn: &mut SqliteConnection,
    collection: &str,
    old_id: &str,
    new_id: &str,
) -> Result<u64, StorageError> {
    let result = sqlx::query(
        "UPDATE pending_mutations
         SET entity_id = ?,
             endpoint = CASE WHEN method = 'create' THEN endpoint ELSE ? END
         WHERE collection = ? AND entity_id = ?",
    )
    .bind(new_id)
    .bind(endpoint_for(MutationMethod::Update, collection, new_id))
    .bind(collection)
    .bind(old_id)
    .execute(&mut *conn)
    .await?;

    let remapped = result.rows_affected();
    if remapped > 0 {
        debug!(collection, old_id, new_id, remapped, "Remapped queued mutations to server id");
    }
    Ok(remapped)
}

fn decode_row(row: &SqliteRow) -> Result<PendingMutation, StorageError> {
    let id: i64 = row.try_get("seq")?;
    let corrupt = |reason: String| StorageError::Corruption {
        id: format!("mutation-{}", id),
        reason,
    };

    let method: String = row.try_get("method")?;
    let state: String = row.try_get("state")?;
    let body: Option<String> = row.try_get("body")?;
    let body = body
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(PendingMutation {
        id,
        method: method.parse::<MutationMethod>().map_err(corrupt)?,
        collection: row.try_get("collection")?,
        entity_id: row.try_get("entity_id")?,
        endpoint: row.try_get("endpoint")?,
        body,
        owner_id: row.try_get("owner_id")?,
        enqueued_at: row.try_get("enqueued_at")?,
        retries: row.try_get::<i64, _>("retries")? as u32,
        next_attempt_at: row.try_get("next_attempt_at")?,
        state: state.parse::<MutationState>().map_err(corrupt)?,
        last_error: row.try_get("last_error")?,
    })
}
