// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Errors surfaced by the public [`SyncClient`](crate::SyncClient) API.
//!
//! Only the write path and explicit reads fail loudly. Cache storage errors
//! never reach this type, and background replay failures are recorded on
//! the mutation row instead (see [`SyncClient::failed_mutations`](crate::SyncClient::failed_mutations)).

use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),

    #[error("payload must be a JSON object")]
    InvalidPayload,

    #[error("entity '{id}' not found in '{collection}'")]
    NotFound { collection: String, id: String },

    #[error("pending mutation {0} not found")]
    MutationNotFound(i64),

    #[error("client is not running (state: {0})")]
    NotRunning(String),
}

impl SyncError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_transient())
    }
}
