// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync client.
//!
//! # Example
//!
//! ```
//! use care_sync::SyncConfig;
//! use std::collections::HashMap;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.default_ttl_secs, 300);
//!
//! // Cache two collections, one with a shorter TTL
//! let config = SyncConfig {
//!     db_path: Some("care-sync.db".into()),
//!     cacheable: HashMap::from([
//!         ("tasks".to_string(), None),
//!         ("daily_logs".to_string(), Some(60)),
//!     ]),
//!     ..Default::default()
//! };
//! assert_eq!(config.ttl_for("daily_logs").map(|t| t.as_secs()), Some(60));
//! assert_eq!(config.ttl_for("tasks").map(|t| t.as_secs()), Some(300));
//! assert_eq!(config.ttl_for("messages"), None);
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::resilience::retry::RetryConfig;

/// Configuration for the sync client.
///
/// All fields have defaults. Set `db_path` for anything that must survive a
/// restart; without it the local store lives in memory.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// SQLite file holding local entities and the mutation queue
    #[serde(default)]
    pub db_path: Option<String>,

    /// Interactive (UI) process. Non-interactive runs bypass the read cache.
    #[serde(default = "default_interactive")]
    pub interactive: bool,

    /// Cache TTL for collections without an override (default: 5 minutes)
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Cacheable collections, each with an optional TTL override in seconds.
    /// Collections not listed are never cached.
    #[serde(default)]
    pub cacheable: HashMap<String, Option<u64>>,

    /// Background drain period
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Mutations replayed per pass
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,

    /// Mutation retry backoff
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    /// Attempts before a mutation is marked failed
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Per-request timeout against the remote backend
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Remote `updated_at` further than this ahead of the local clock is
    /// flagged as clock skew
    #[serde(default = "default_clock_skew_tolerance_ms")]
    pub clock_skew_tolerance_ms: i64,
}

fn default_interactive() -> bool { true }
fn default_ttl_secs() -> u64 { 300 } // 5 minutes
fn default_drain_interval_ms() -> u64 { 5_000 }
fn default_drain_batch_size() -> usize { 50 }
fn default_retry_initial_ms() -> u64 { 1_000 }
fn default_retry_max_ms() -> u64 { 300_000 } // 5 minutes
fn default_retry_factor() -> f64 { 2.0 }
fn default_retry_max_attempts() -> u32 { 8 }
fn default_remote_timeout_ms() -> u64 { 15_000 }
fn default_clock_skew_tolerance_ms() -> i64 { 60_000 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            interactive: default_interactive(),
            default_ttl_secs: default_ttl_secs(),
            cacheable: HashMap::new(),
            drain_interval_ms: default_drain_interval_ms(),
            drain_batch_size: default_drain_batch_size(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_factor: default_retry_factor(),
            retry_max_attempts: default_retry_max_attempts(),
            remote_timeout_ms: default_remote_timeout_ms(),
            clock_skew_tolerance_ms: default_clock_skew_tolerance_ms(),
        }
    }
}

impl SyncConfig {
    /// TTL for `collection`, or `None` if it is not cacheable.
    #[must_use]
    pub fn ttl_for(&self, collection: &str) -> Option<Duration> {
        self.cacheable
            .get(collection)
            .map(|ttl| Duration::from_secs(ttl.unwrap_or(self.default_ttl_secs)))
    }

    /// Backoff policy for queued mutations.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            factor: self.retry_factor,
            max_retries: Some(self.retry_max_attempts as usize),
        }
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}
