// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote data source.
//!
//! The authoritative backend, reached over per-collection list / insert /
//! update / delete calls. Implementations have no side effects beyond the
//! remote call itself: they never touch the read cache or the local store.
//!
//! Every failure is classified:
//! - [`RemoteError::Transient`]: network loss, timeout, 408/429, 5xx. Safe to retry.
//! - [`RemoteError::Rejected`]: any other 4xx. Never retried blindly.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::entity::Record;
use crate::query::Query;

pub use http::HttpRemote;
pub use memory::InMemoryRemote;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transient remote failure: {message}")]
    Transient {
        /// HTTP-equivalent status, if the backend answered at all
        status: Option<u16>,
        message: String,
    },
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// The backend answered with something that isn't a row.
    ///
    /// Treated as a rejection: the write may already have been applied, so
    /// replaying it blindly could duplicate it.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::rejected(502, format!("malformed response: {}", message.into()))
    }

    /// Classify an HTTP-equivalent error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 425 | 429 => Self::Transient {
                status: Some(status),
                message: message.into(),
            },
            400..=499 => Self::rejected(status, message),
            _ => Self::Transient {
                status: Some(status),
                message: message.into(),
            },
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Status code, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } => *status,
            Self::Rejected { status, .. } => Some(*status),
        }
    }
}

/// `insert`/`update` take the full row body as the backend stores it
/// (payload fields plus `owner_id`, see [`row_body`]).
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    async fn list(&self, query: &Query) -> Result<Vec<Record>, RemoteError>;
    async fn insert(&self, collection: &str, payload: &Value) -> Result<Record, RemoteError>;
    async fn update(&self, collection: &str, id: &str, payload: &Value) -> Result<Record, RemoteError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;
}

/// Columns the backend manages itself; never part of a payload.
const METADATA_COLUMNS: [&str; 4] = ["id", "owner_id", "created_at", "updated_at"];

/// Build the row body sent on insert/update: the payload's fields plus `owner_id`.
pub fn row_body(owner_id: &str, payload: &Value) -> Value {
    let mut row = match payload {
        Value::Object(fields) => fields
            .iter()
            .filter(|(k, _)| !METADATA_COLUMNS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => serde_json::Map::new(),
    };
    row.insert("owner_id".into(), Value::String(owner_id.to_string()));
    Value::Object(row)
}

/// Split a backend row into metadata and payload.
///
/// Timestamps may be epoch milliseconds or RFC 3339 strings.
pub fn record_from_row(row: Value) -> Result<Record, RemoteError> {
    let Value::Object(mut fields) = row else {
        return Err(RemoteError::malformed("row is not an object"));
    };

    let id = match fields.remove("id") {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(RemoteError::malformed("row has no id")),
    };
    let owner_id = match fields.remove("owner_id") {
        Some(Value::String(s)) => s,
        _ => return Err(RemoteError::malformed(format!("row {} has no owner_id", id))),
    };
    let created_at = fields.remove("created_at").and_then(|v| parse_timestamp(&v)).unwrap_or(0);
    let updated_at = fields
        .remove("updated_at")
        .and_then(|v| parse_timestamp(&v))
        .unwrap_or(created_at);

    Ok(Record {
        id,
        owner_id,
        created_at,
        updated_at,
        payload: Value::Object(fields),
    })
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}
