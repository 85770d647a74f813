// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed query descriptors.
//!
//! A [`Query`] names a collection plus explicit filter, sort and limit
//! fields. It serializes deterministically into a [`CacheKey`] of the form
//! `"<collection>:<digest>"`, so two queries that mean the same thing always
//! share a cache entry and every key of a collection shares its prefix.
//!
//! # Example
//!
//! ```rust
//! use care_sync::query::{Query, SortOrder};
//!
//! let query = Query::new("daily_logs")
//!     .filter_eq("owner_id", "patient-7")
//!     .sort_by("created_at", SortOrder::Desc)
//!     .limit(50);
//!
//! let key = query.cache_key();
//! assert!(key.as_str().starts_with("daily_logs:"));
//! assert_eq!(key.collection(), "daily_logs");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use crate::entity::Record;

/// Separates the collection from the query digest in a cache key.
pub const KEY_SEPARATOR: char = ':';

/// Collection names double as SQLite table suffixes and cache key prefixes.
#[must_use]
pub fn is_valid_collection(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    /// PostgREST operator token.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        }
    }
}

/// A single field predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

/// Query against one remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Option<Sort>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            sort: None,
            limit: None,
        }
    }

    /// All rows of `collection` owned by `owner_id`, newest first.
    pub fn for_owner(collection: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self::new(collection)
            .filter_eq("owner_id", owner_id.into())
            .sort_by("created_at", SortOrder::Desc)
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn filter_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            order,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Deterministic cache key.
    ///
    /// Filters are ordered before hashing, so insertion order does not
    /// change the key.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        let mut filters: Vec<&Filter> = self.filters.iter().collect();
        filters.sort_by(|a, b| {
            a.field
                .cmp(&b.field)
                .then(a.op.cmp(&b.op))
                .then_with(|| a.value.to_string().cmp(&b.value.to_string()))
        });

        let canonical = serde_json::json!({
            "filters": filters,
            "sort": self.sort,
            "limit": self.limit,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        let digest = hasher.finalize();

        CacheKey(format!(
            "{}{}{}",
            self.collection,
            KEY_SEPARATOR,
            hex::encode(&digest[..8])
        ))
    }

    /// Whether a record satisfies every filter.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| {
            let Some(actual) = field_value(record, &f.field) else {
                return false;
            };
            let ord = compare_values(&actual, &f.value);
            match f.op {
                FilterOp::Eq => ord == Some(Ordering::Equal),
                FilterOp::Neq => ord != Some(Ordering::Equal),
                FilterOp::Gt => ord == Some(Ordering::Greater),
                FilterOp::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                FilterOp::Lt => ord == Some(Ordering::Less),
                FilterOp::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            }
        })
    }

    /// Filter, sort and truncate `records` the way the backend would.
    pub fn apply(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut rows: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();

        if let Some(ref sort) = self.sort {
            rows.sort_by(|a, b| {
                let ord = match (field_value(a, &sort.field), field_value(b, &sort.field)) {
                    (Some(x), Some(y)) => compare_values(&x, &y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match sort.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

/// Column names resolve to record metadata; anything else reads the payload.
fn field_value(record: &Record, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::String(record.id.clone())),
        "owner_id" => Some(Value::String(record.owner_id.clone())),
        "created_at" => Some(Value::from(record.created_at)),
        "updated_at" => Some(Value::from(record.updated_at)),
        other => record.payload.get(other).cloned(),
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Fully-qualified cache key (`<collection>:<digest>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse a string that already has the `<collection>:<digest>` shape.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (collection, digest) = raw.split_once(KEY_SEPARATOR)?;
        if is_valid_collection(collection) && !digest.is_empty() {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Collection portion of the key.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.0
            .split_once(KEY_SEPARATOR)
            .map(|(c, _)| c)
            .unwrap_or(&self.0)
    }

    /// Prefix shared by every key of `collection`.
    #[must_use]
    pub fn prefix_for(collection: &str) -> String {
        format!("{}{}", collection, KEY_SEPARATOR)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
