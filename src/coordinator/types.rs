// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync client.

use serde_json::Value;

use crate::cache::CacheStats;
use crate::queue::QueueStats;

/// Client lifecycle state.
///
/// Use [`super::SyncClient::state()`] to check current state or
/// [`super::SyncClient::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Storage open, background drain not started
    Created,
    /// Background drain loop running
    Running,
    /// Waiting for the drain loop to finish its pass
    ShuttingDown,
    /// Drain loop stopped; reads and writes still work
    Stopped,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// An optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// New entity; gets a `local-*` id until the backend assigns one
    Create { owner_id: String, payload: Value },
    /// Replace the payload of an existing entity
    Update { id: String, owner_id: String, payload: Value },
    Delete { id: String, owner_id: String },
}

impl WriteRequest {
    pub fn create(owner_id: impl Into<String>, payload: Value) -> Self {
        Self::Create {
            owner_id: owner_id.into(),
            payload,
        }
    }

    pub fn update(id: impl Into<String>, owner_id: impl Into<String>, payload: Value) -> Self {
        Self::Update {
            id: id.into(),
            owner_id: owner_id.into(),
            payload,
        }
    }

    pub fn delete(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self::Delete {
            id: id.into(),
            owner_id: owner_id.into(),
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            Self::Create { owner_id, .. } | Self::Update { owner_id, .. } | Self::Delete { owner_id, .. } => owner_id,
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Mutations sent to the backend
    pub attempted: usize,
    /// Confirmed and removed from the queue
    pub acked: usize,
    /// Failed transiently, rescheduled with backoff
    pub retried: usize,
    /// Rejected or out of retries, now waiting for manual resolution
    pub failed: usize,
    /// Left in the queue untouched (blocked entity, not yet due, or gone)
    pub skipped: usize,
    /// Another pass was already running; nothing was done
    pub contended: bool,
}

impl DrainReport {
    /// Add another pass's counts to this one.
    pub fn absorb(&mut self, other: DrainReport) {
        self.attempted += other.attempted;
        self.acked += other.acked;
        self.retried += other.retried;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.contended |= other.contended;
    }

    /// Whether the pass touched nothing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.attempted == 0
    }
}

/// Point-in-time client status, cheap to collect (no remote calls).
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub state: ClientState,
    /// Remote considered reachable
    pub online: bool,
    /// Consecutive transient remote failures
    pub remote_failures: u64,
    pub queue: QueueStats,
    pub cache: CacheStats,
    /// A drain pass is running right now
    pub draining: bool,
}

impl SyncStatus {
    /// Every local write has reached the backend.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.queue.pending() == 0 && self.queue.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_state_display() {
        assert_eq!(format!("{}", ClientState::Created), "Created");
        assert_eq!(format!("{}", ClientState::Running), "Running");
        assert_eq!(format!("{}", ClientState::Stopped), "Stopped");
    }

    #[test]
    fn test_drain_report_absorb() {
        let mut total = DrainReport::default();
        assert!(total.is_idle());

        total.absorb(DrainReport { attempted: 3, acked: 2, retried: 1, ..Default::default() });
        total.absorb(DrainReport { contended: true, ..Default::default() });
        assert_eq!(total.attempted, 3);
        assert_eq!(total.acked, 2);
        assert!(total.contended);
        assert!(!total.is_idle());
    }

    #[test]
    fn test_write_request_owner() {
        assert_eq!(WriteRequest::create("o1", json!({})).owner_id(), "o1");
        assert_eq!(WriteRequest::delete("srv-1", "o2").owner_id(), "o2");
    }
}
