// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Merge of the remote snapshot with local entities.
//!
//! Precedence, per id:
//!
//! 1. Local copy with `synced = false`: always wins. An unconfirmed edit is
//!    never hidden by a remote read that raced ahead of its invalidation.
//! 2. Confirmed local copy with `local_updated_at` strictly newer than the
//!    remote `updated_at`: wins (the snapshot is stale).
//! 3. Otherwise the remote row.
//!
//! Remote-only rows pass through; local-only rows pass through as pending
//! creations. An unconfirmed local delete hides the id entirely unless that
//! delete has failed, in which case the last known row stays visible with
//! [`SyncState::Failed`].
//!
//! Step 2 compares the client clock with the server clock. Nothing keeps
//! them in sync; server timestamps too far in the future are reported in
//! [`MergedView::skewed`] but the comparison is still made.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{GetOptions, ReadCache, Source};
use crate::entity::{now_millis, LocalEntity, MergedEntity, Origin, Record, SyncState};
use crate::error::SyncError;
use crate::query::{is_valid_collection, Query};
use crate::queue::MutationQueue;
use crate::storage::local::LocalStore;

/// Consumer-facing read model of one collection for one owner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedView {
    /// Newest first (`created_at` descending, ties by id)
    pub entities: Vec<MergedEntity>,
    /// Remote unreachable; built from the last confirmed local state
    pub offline: bool,
    /// Whether the remote part came from the read cache
    pub from_cache: bool,
    /// Ids whose server `updated_at` is ahead of the local clock by more than the tolerance
    pub skewed: Vec<String>,
}

impl MergedView {
    pub fn get(&self, id: &str) -> Option<&MergedEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities whose latest local write has not reached the backend.
    pub fn pending(&self) -> impl Iterator<Item = &MergedEntity> {
        self.entities.iter().filter(|e| e.sync_state != SyncState::Synced)
    }
}

/// Merge `remote` and `local` under the precedence rules above.
///
/// `failed` holds ids with a failed mutation. Pure; does no I/O.
pub fn reconcile(remote: Vec<Record>, local: Vec<LocalEntity>, failed: &HashSet<String>) -> Vec<MergedEntity> {
    let mut remote_by_id: HashMap<String, Record> = HashMap::with_capacity(remote.len());
    let mut remote_order: Vec<String> = Vec::with_capacity(remote.len());
    for record in remote {
        if !remote_by_id.contains_key(&record.id) {
            remote_order.push(record.id.clone());
            remote_by_id.insert(record.id.clone(), record);
        }
    }

    let mut merged = Vec::with_capacity(remote_by_id.len() + local.len());
    let mut seen: HashSet<String> = HashSet::with_capacity(local.len());

    for entity in local {
        if !seen.insert(entity.id.clone()) {
            continue;
        }
        let is_failed = failed.contains(&entity.id);
        let remote_row = remote_by_id.remove(&entity.id);

        let sync_state = if is_failed {
            SyncState::Failed
        } else if entity.synced {
            SyncState::Synced
        } else {
            SyncState::Pending
        };

        if entity.deleted && !entity.synced {
            if !is_failed {
                continue;
            }
            // Rejected delete: show what the user had before deleting
            merged.push(match remote_row {
                Some(record) => from_remote(record, SyncState::Failed),
                None => from_local(entity, None, SyncState::Failed),
            });
            continue;
        }

        match remote_row {
            Some(record) if entity.synced && entity.local_updated_at <= record.updated_at => {
                merged.push(from_remote(record, sync_state));
            }
            Some(record) => {
                merged.push(from_local(entity, Some(&record), sync_state));
            }
            None => {
                merged.push(from_local(entity, None, sync_state));
            }
        }
    }

    for id in remote_order {
        if let Some(record) = remote_by_id.remove(&id) {
            let state = if failed.contains(&id) { SyncState::Failed } else { SyncState::Synced };
            merged.push(from_remote(record, state));
        }
    }

    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    merged
}

/// Ids of rows whose server timestamp is more than `tolerance_ms` ahead of `now`.
pub fn detect_clock_skew(remote: &[Record], now: i64, tolerance_ms: i64) -> Vec<String> {
    remote
        .iter()
        .filter(|r| r.updated_at.saturating_sub(now) > tolerance_ms)
        .map(|r| r.id.clone())
        .collect()
}

fn from_remote(record: Record, sync_state: SyncState) -> MergedEntity {
    MergedEntity {
        id: record.id,
        owner_id: record.owner_id,
        payload: record.payload,
        created_at: record.created_at,
        updated_at: record.updated_at,
        origin: Origin::Remote,
        sync_state,
    }
}

fn from_local(entity: LocalEntity, remote: Option<&Record>, sync_state: SyncState) -> MergedEntity {
    let origin = if remote.is_some() { Origin::Local } else { Origin::PendingCreate };
    MergedEntity {
        // The server's creation time stays authoritative for ordering
        created_at: remote.map(|r| r.created_at).unwrap_or(entity.created_at),
        updated_at: entity.local_updated_at,
        id: entity.id,
        owner_id: entity.owner_id,
        payload: entity.payload,
        origin,
        sync_state,
    }
}

/// Last confirmed local state, standing in for the remote snapshot while offline.
fn confirmed_baseline(local: &[LocalEntity]) -> Vec<Record> {
    local
        .iter()
        .filter(|e| e.synced && !e.deleted)
        .map(|e| Record {
            id: e.id.clone(),
            owner_id: e.owner_id.clone(),
            created_at: e.created_at,
            updated_at: e.local_updated_at,
            payload: e.payload.clone(),
        })
        .collect()
}

pub struct SyncReconciler {
    cache: Arc<ReadCache>,
    local: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    skew_tolerance_ms: i64,
}

impl SyncReconciler {
    pub fn new(cache: Arc<ReadCache>, local: Arc<LocalStore>, queue: Arc<MutationQueue>, skew_tolerance_ms: i64) -> Self {
        Self {
            cache,
            local,
            queue,
            skew_tolerance_ms,
        }
    }

    /// Merged view of `collection` for `owner_id`.
    ///
    /// A transient remote failure degrades to the local state
    /// (`offline = true`); a rejected list call is returned as an error.
    #[tracing::instrument(skip(self, options), fields(collection = %collection, owner_id = %owner_id))]
    pub async fn merged_view(&self, collection: &str, owner_id: &str, options: GetOptions) -> Result<MergedView, SyncError> {
        if !is_valid_collection(collection) {
            return Err(SyncError::InvalidCollection(collection.to_string()));
        }
        let _timer = crate::metrics::LatencyTimer::new(collection);

        let query = Query::for_owner(collection, owner_id);
        let remote = self.cache.get(&query, options).await;

        let local = self.local.get_by_owner(collection, owner_id).await?;
        let failed = self.queue.failed_entities(collection).await?;

        let (remote_rows, offline, from_cache) = match remote {
            Ok((rows, source)) => (rows, false, source == Source::Cache),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Remote unavailable, serving local state");
                (confirmed_baseline(&local), true, false)
            }
            Err(e) => return Err(e.into()),
        };

        let skewed = if offline {
            Vec::new()
        } else {
            detect_clock_skew(&remote_rows, now_millis(), self.skew_tolerance_ms)
        };
        if !skewed.is_empty() {
            warn!(count = skewed.len(), "Server timestamps ahead of local clock");
            crate::metrics::record_clock_skew(collection);
        }

        let entities = reconcile(remote_rows, local, &failed);
        debug!(
            entities = entities.len(),
            offline,
            from_cache,
            "Merged view built"
        );

        Ok(MergedView {
            entities,
            offline,
            from_cache,
            skewed,
        })
    }
}
