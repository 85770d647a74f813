// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgREST-style HTTP backend.
//!
//! Each collection is a table under `{base_url}/rest/v1/{collection}`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list      | `GET ?select=*&owner_id=eq.X&order=created_at.desc&limit=N` |
//! | insert    | `POST` body, `Prefer: return=representation` |
//! | update    | `PATCH ?id=eq.X` body, `Prefer: return=representation` |
//! | delete    | `DELETE ?id=eq.X` |
//!
//! Timeouts and connection failures are transient, including ones that cut a
//! response body short; statuses are classified by
//! [`RemoteError::from_status`]. Only a body that arrives whole and fails to
//! decode is malformed.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{record_from_row, RemoteDataSource, RemoteError};
use crate::entity::Record;
use crate::query::{is_valid_collection, Query, SortOrder};

pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: String,
    /// Session token; falls back to the api key
    access_token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| RemoteError::transient(format!("http client init failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    /// Authenticate as a signed-in user rather than the anonymous key.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self, collection: &str) -> Result<String, RemoteError> {
        if !is_valid_collection(collection) {
            return Err(RemoteError::rejected(400, format!("invalid collection '{}'", collection)));
        }
        Ok(format!("{}/rest/v1/{}", self.base_url, collection))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn send(&self, op: &'static str, collection: &str, request: RequestBuilder) -> Result<Response, RemoteError> {
        let start = Instant::now();
        let result = self.authorize(request).send().await;
        crate::metrics::record_remote_latency(op, start.elapsed());

        let response = result.map_err(|e| {
            warn!(op, collection, error = %e, "Remote request failed");
            classify_transport_error(&e)
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(op, collection, status = status.as_u16(), "Remote request ok");
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), body))
    }

    async fn single_row(op: &'static str, collection: &str, response: Response) -> Result<Record, RemoteError> {
        let rows = read_rows(op, collection, response).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::malformed("empty representation"))?;
        record_from_row(row)
    }
}

#[async_trait]
impl RemoteDataSource for HttpRemote {
    async fn list(&self, query: &Query) -> Result<Vec<Record>, RemoteError> {
        let url = self.table_url(&query.collection)?;
        let request = self.client.get(url).query(&list_params(query));
        let response = self.send("list", &query.collection, request).await?;

        let rows = read_rows("list", &query.collection, response).await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn insert(&self, collection: &str, payload: &Value) -> Result<Record, RemoteError> {
        let url = self.table_url(collection)?;
        let request = self
            .client
            .post(url)
            .header("Prefer", "return=representation")
            .json(payload);
        let response = self.send("insert", collection, request).await?;
        Self::single_row("insert", collection, response).await
    }

    async fn update(&self, collection: &str, id: &str, payload: &Value) -> Result<Record, RemoteError> {
        let url = self.table_url(collection)?;
        let request = self
            .client
            .patch(url)
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(payload);
        let response = self.send("update", collection, request).await?;

        // PostgREST answers an update of a missing row with an empty list
        match Self::single_row("update", collection, response).await {
            Err(RemoteError::Rejected { status: 502, .. }) => {
                Err(RemoteError::rejected(404, format!("{} not found", id)))
            }
            other => other,
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.table_url(collection)?;
        let request = self.client.delete(url).query(&[("id", format!("eq.{}", id))]);
        self.send("delete", collection, request).await?;
        Ok(())
    }
}

/// Query-string pairs for a list request.
fn list_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];

    for filter in &query.filters {
        let value = match &filter.value {
            Value::Null => {
                params.push((filter.field.clone(), "is.null".to_string()));
                continue;
            }
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        params.push((filter.field.clone(), format!("{}.{}", filter.op.as_str(), value)));
    }

    if let Some(ref sort) = query.sort {
        let direction = match sort.order {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        };
        params.push(("order".to_string(), format!("{}.{}", sort.field, direction)));
    }

    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// Read a JSON array of rows. A body that stops arriving is a transport
/// failure; one that arrives and doesn't parse is malformed.
async fn read_rows(op: &'static str, collection: &str, response: Response) -> Result<Vec<Value>, RemoteError> {
    let body = response.bytes().await.map_err(|e| {
        warn!(op, collection, error = %e, "Remote response body incomplete");
        classify_transport_error(&e)
    })?;
    serde_json::from_slice(&body).map_err(|e| RemoteError::malformed(e.to_string()))
}

fn classify_transport_error(err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::transient("request timed out")
    } else if let Some(status) = err.status() {
        RemoteError::from_status(status.as_u16(), err.to_string())
    } else {
        // Connection refused, DNS, TLS, reset: all network-level
        RemoteError::transient(err.to_string())
    }
}
