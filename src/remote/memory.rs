// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote backend.
//!
//! Behaves like the hosted backend (server-assigned `srv-N` ids, server
//! timestamps, PATCH-style updates) and adds two things the real one can't:
//! scripted faults and a log of every call it served. Used for development
//! without a network and for exercising retry and ordering behavior.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{record_from_row, RemoteDataSource, RemoteError};
use crate::entity::{now_millis, Record};
use crate::query::Query;

/// Kind of remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    List,
    Insert,
    Update,
    Delete,
}

/// One call as the backend saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub collection: String,
    pub id: Option<String>,
    pub body: Option<Value>,
    /// Whether the call was served (false if a fault was injected)
    pub served: bool,
}

struct Fault {
    op: Option<RemoteOp>,
    error: RemoteError,
}

pub struct InMemoryRemote {
    /// collection -> id -> record
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    next_id: AtomicU64,
    faults: Mutex<VecDeque<Fault>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            faults: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
            latency: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next call of kind `op` (any kind if `None`) with `error`.
    /// Faults queue up and fire in the order they were added.
    pub fn fail_next(&self, op: Option<RemoteOp>, error: RemoteError) {
        self.faults.lock().push_back(Fault { op, error });
    }

    /// Simulate connectivity loss: every call fails transiently.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Seed a row directly, bypassing the call log.
    pub fn seed(&self, collection: &str, record: Record) {
        self.tables
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Every call served or refused so far, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Calls other than `list`.
    pub fn write_calls(&self) -> Vec<RemoteCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.op != RemoteOp::List)
            .cloned()
            .collect()
    }

    pub fn count_calls(&self, op: RemoteOp) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        self.tables.lock().get(collection).and_then(|t| t.get(id).cloned())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.tables.lock().get(collection).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Simulate latency and pending faults, then log the call.
    async fn enter(
        &self,
        op: RemoteOp,
        collection: &str,
        id: Option<&str>,
        body: Option<&Value>,
    ) -> Result<(), RemoteError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let fault = if self.offline.load(Ordering::Acquire) {
            Some(RemoteError::transient("network unreachable"))
        } else {
            let mut faults = self.faults.lock();
            let position = faults.iter().position(|f| f.op.map_or(true, |o| o == op));
            position.and_then(|i| faults.remove(i)).map(|f| f.error)
        };

        self.calls.lock().push(RemoteCall {
            op,
            collection: collection.to_string(),
            id: id.map(str::to_string),
            body: body.cloned(),
            served: fault.is_none(),
        });

        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteDataSource for InMemoryRemote {
    async fn list(&self, query: &Query) -> Result<Vec<Record>, RemoteError> {
        self.enter(RemoteOp::List, &query.collection, None, None).await?;
        let rows: Vec<Record> = self
            .tables
            .lock()
            .get(&query.collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        Ok(query.apply(rows))
    }

    async fn insert(&self, collection: &str, payload: &Value) -> Result<Record, RemoteError> {
        self.enter(RemoteOp::Insert, collection, None, Some(payload)).await?;

        let Value::Object(fields) = payload else {
            return Err(RemoteError::rejected(400, "row body must be an object"));
        };
        if !fields.contains_key("owner_id") {
            return Err(RemoteError::rejected(422, "owner_id is required"));
        }

        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::AcqRel));
        let now = now_millis();
        let mut row = fields.clone();
        row.insert("id".into(), Value::String(id.clone()));
        row.insert("created_at".into(), Value::from(now));
        row.insert("updated_at".into(), Value::from(now));

        let record = record_from_row(Value::Object(row))?;
        self.tables
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, payload: &Value) -> Result<Record, RemoteError> {
        self.enter(RemoteOp::Update, collection, Some(id), Some(payload)).await?;

        let Value::Object(fields) = payload else {
            return Err(RemoteError::rejected(400, "row body must be an object"));
        };

        let mut tables = self.tables.lock();
        let Some(existing) = tables.get_mut(collection).and_then(|t| t.get_mut(id)) else {
            return Err(RemoteError::rejected(404, format!("{} not found", id)));
        };

        let mut merged = match existing.payload.clone() {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (k, v) in fields {
            if !matches!(k.as_str(), "id" | "owner_id" | "created_at" | "updated_at") {
                merged.insert(k.clone(), v.clone());
            }
        }
        existing.payload = Value::Object(merged);
        // Server clock never moves a row backwards.
        existing.updated_at = now_millis().max(existing.updated_at + 1);
        Ok(existing.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.enter(RemoteOp::Delete, collection, Some(id), None).await?;
        if let Some(table) = self.tables.lock().get_mut(collection) {
            table.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_server_id() {
        let remote = InMemoryRemote::new();
        let record = remote
            .insert("tasks", &json!({"owner_id": "o1", "title": "walk"}))
            .await
            .unwrap();

        assert_eq!(record.id, "srv-1");
        assert_eq!(record.owner_id, "o1");
        assert_eq!(record.payload, json!({"title": "walk"}));
        assert_eq!(remote.len("tasks"), 1);
    }

    #[tokio::test]
    async fn test_insert_without_owner_is_rejected() {
        let remote = InMemoryRemote::new();
        let err = remote.insert("tasks", &json!({"title": "walk"})).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_update_merges_and_advances_clock() {
        let remote = InMemoryRemote::new();
        let created = remote
            .insert("tasks", &json!({"owner_id": "o1", "title": "walk", "done": false}))
            .await
            .unwrap();

        let updated = remote
            .update("tasks", &created.id, &json!({"owner_id": "o1", "done": true}))
            .await
            .unwrap();
        assert_eq!(updated.payload, json!({"title": "walk", "done": true}));
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn test_update_missing_is_rejected() {
        let remote = InMemoryRemote::new();
        let err = remote.update("tasks", "srv-404", &json!({})).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_list_applies_query() {
        let remote = InMemoryRemote::new();
        remote.insert("tasks", &json!({"owner_id": "o1", "n": 1})).await.unwrap();
        remote.insert("tasks", &json!({"owner_id": "o2", "n": 2})).await.unwrap();

        let rows = remote.list(&Query::for_owner("tasks", "o1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner_id, "o1");
    }

    #[tokio::test]
    async fn test_scripted_fault_fires_once_for_matching_op() {
        let remote = InMemoryRemote::new();
        remote.fail_next(Some(RemoteOp::Insert), RemoteError::transient("timeout"));

        // List is not affected
        remote.list(&Query::new("tasks")).await.unwrap();

        let body = json!({"owner_id": "o1"});
        assert!(remote.insert("tasks", &body).await.unwrap_err().is_transient());
        assert!(remote.insert("tasks", &body).await.is_ok());

        let inserts: Vec<bool> = remote
            .calls()
            .iter()
            .filter(|c| c.op == RemoteOp::Insert)
            .map(|c| c.served)
            .collect();
        assert_eq!(inserts, vec![false, true]);
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let remote = InMemoryRemote::new();
        remote.set_offline(true);
        assert!(remote.list(&Query::new("tasks")).await.unwrap_err().is_transient());
        remote.set_offline(false);
        assert!(remote.list(&Query::new("tasks")).await.is_ok());
    }
}
