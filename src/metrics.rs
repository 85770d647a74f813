// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for care-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `care_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `op`: list, insert, update, delete
//! - `collection`: logical table name
//! - `outcome`: hit, miss, bypass / acked, retried, failed

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a read-cache lookup outcome (`hit`, `miss`, `bypass`)
pub fn record_cache_lookup(collection: &str, outcome: &'static str) {
    counter!(
        "care_sync_cache_lookups_total",
        "collection" => collection.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record cache entries dropped by an invalidation
pub fn record_cache_invalidation(scope: &'static str, removed: usize) {
    counter!("care_sync_cache_invalidations_total", "scope" => scope).increment(1);
    counter!("care_sync_cache_evicted_entries_total").increment(removed as u64);
}

/// Record a swallowed cache storage error
pub fn record_cache_error(operation: &'static str) {
    counter!("care_sync_cache_errors_total", "operation" => operation).increment(1);
}

/// Record one remote call and its outcome (`ok`, `transient`, `rejected`)
pub fn record_remote_call(op: &'static str, outcome: &'static str) {
    counter!(
        "care_sync_remote_calls_total",
        "op" => op,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record remote call latency
pub fn record_remote_latency(op: &'static str, duration: Duration) {
    histogram!("care_sync_remote_call_seconds", "op" => op).record(duration.as_secs_f64());
}

/// Set remote connectivity (1 = online, 0 = offline)
pub fn set_remote_online(online: bool) {
    gauge!("care_sync_remote_online").set(if online { 1.0 } else { 0.0 });
}

/// Record an optimistic local write
pub fn record_local_write(collection: &str, method: &'static str) {
    counter!(
        "care_sync_local_writes_total",
        "collection" => collection.to_string(),
        "method" => method
    )
    .increment(1);
}

/// Record data corruption detected in the local store
pub fn record_corruption(collection: &str) {
    counter!(
        "care_sync_corruption_detected_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Set queued (not yet acknowledged, not failed) mutations
pub fn set_queue_depth(count: u64) {
    gauge!("care_sync_queue_depth").set(count as f64);
}

/// Set mutations waiting for manual resolution
pub fn set_failed_mutations(count: u64) {
    gauge!("care_sync_failed_mutations").set(count as f64);
}

/// Record the outcome of replaying one mutation (`acked`, `retried`, `failed`)
pub fn record_mutation_outcome(method: &'static str, outcome: &'static str) {
    counter!(
        "care_sync_mutations_total",
        "method" => method,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a completed drain pass
pub fn record_drain(attempted: usize, duration: Duration) {
    counter!("care_sync_drain_passes_total").increment(1);
    histogram!("care_sync_drain_batch_size").record(attempted as f64);
    histogram!("care_sync_drain_seconds").record(duration.as_secs_f64());
}

/// Record a drain request that found another pass already running
pub fn record_drain_contended() {
    counter!("care_sync_drain_contended_total").increment(1);
}

/// Record a record whose server clock is far from ours
pub fn record_clock_skew(collection: &str) {
    counter!(
        "care_sync_clock_skew_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Set client state (for dashboards)
pub fn set_client_state(state: &str) {
    // One gauge per state, only the active one is 1
    for s in ["Created", "Running", "ShuttingDown", "Stopped"] {
        gauge!("care_sync_client_state", "state" => s).set(if s == state { 1.0 } else { 0.0 });
    }
}

/// A timing guard that records a merged-view latency on drop
pub struct LatencyTimer {
    collection: String,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "care_sync_merged_view_seconds",
            "collection" => self.collection.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without an installed recorder these are no-ops; they must not panic.

    #[test]
    fn test_no_recorder_is_noop() {
        record_cache_lookup("tasks", "hit");
        record_cache_invalidation("collection", 3);
        record_remote_call("insert", "transient");
        record_remote_latency("list", Duration::from_millis(20));
        set_queue_depth(4);
        set_failed_mutations(1);
        record_drain(10, Duration::from_millis(5));
        set_client_state("Running");
    }

    #[test]
    fn test_counters_reach_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_cache_lookup("tasks", "miss");
            record_cache_lookup("tasks", "miss");
            record_mutation_outcome("create", "acked");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let lookups = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "care_sync_cache_lookups_total")
            .map(|(_, _, _, value)| value.clone());
        assert_eq!(lookups, Some(&DebugValue::Counter(2)));

        assert!(snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "care_sync_mutations_total"));
    }

    #[test]
    fn test_latency_timer() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let _timer = LatencyTimer::new("tasks");
            std::thread::sleep(Duration::from_micros(10));
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert!(snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "care_sync_merged_view_seconds"));
    }
}
