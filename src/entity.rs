// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity data structures.
//!
//! Two shapes flow through the crate:
//! - [`Record`]: a row as the remote backend returns it (authoritative).
//! - [`LocalEntity`]: a row held in the local store, tagged with sync metadata.
//!
//! # Example
//!
//! ```
//! use care_sync::LocalEntity;
//! use serde_json::json;
//!
//! let entity = LocalEntity::new_local("tasks", "patient-7", json!({"title": "Walk 20 min"}));
//!
//! assert!(entity.id.starts_with("local-"));
//! assert!(!entity.synced);
//! assert!(entity.is_local_only());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix for ids minted on the client before the backend assigns one.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A row from the authoritative remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Server-assigned id
    pub id: String,
    /// Owning user (patient or specialist)
    pub owner_id: String,
    /// Creation time (epoch millis)
    pub created_at: i64,
    /// Last server-side modification (epoch millis)
    pub updated_at: i64,
    /// Domain payload (task, log entry, reflection, ...)
    pub payload: Value,
}

/// A row in the local durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    /// Entity id (`local-*` until the backend confirms a create)
    pub id: String,
    /// Logical table this entity belongs to
    pub collection: String,
    /// Owning user
    pub owner_id: String,
    /// Domain payload
    pub payload: Value,
    /// True once the backend has confirmed the latest local write
    pub synced: bool,
    /// Tombstone for a delete that is not yet confirmed
    #[serde(default)]
    pub deleted: bool,
    /// Creation time (epoch millis)
    pub created_at: i64,
    /// Time of the last local write (epoch millis)
    pub local_updated_at: i64,
}

impl LocalEntity {
    /// Create a brand-new entity that only exists locally.
    pub fn new_local(collection: impl Into<String>, owner_id: impl Into<String>, payload: Value) -> Self {
        let now = now_millis();
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
            collection: collection.into(),
            owner_id: owner_id.into(),
            payload,
            synced: false,
            deleted: false,
            created_at: now,
            local_updated_at: now,
        }
    }

    /// Build the local copy of a confirmed remote record.
    pub fn from_record(collection: impl Into<String>, record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            collection: collection.into(),
            owner_id: record.owner_id.clone(),
            payload: record.payload.clone(),
            synced: true,
            deleted: false,
            created_at: record.created_at,
            local_updated_at: record.updated_at,
        }
    }

    /// Whether the id was minted locally and never confirmed by the backend.
    #[must_use]
    pub fn is_local_only(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// Where a merged entity's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Remote snapshot won (or was the only source)
    Remote,
    /// Local copy of a remote entity won
    Local,
    /// Exists only locally, waiting for its create to be confirmed
    PendingCreate,
}

/// Sync state as seen by a consumer of the merged view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Local and remote agree
    Synced,
    /// A local write is waiting in the queue
    Pending,
    /// A local write was rejected or gave up; needs manual resolution
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => write!(f, "synced"),
            Self::Pending => write!(f, "pending"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One entity in the consumer-facing merged view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedEntity {
    pub id: String,
    pub owner_id: String,
    pub payload: Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub origin: Origin,
    pub sync_state: SyncState,
}
