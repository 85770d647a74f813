// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote connectivity tracking.
//!
//! Counts consecutive transient failures against the remote backend. After
//! [`ConnectivityMonitor::OFFLINE_THRESHOLD`] in a row the client is
//! considered offline; one success brings it back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

pub struct ConnectivityMonitor {
    /// Last known state
    online: AtomicBool,
    /// Consecutive failure count
    failures: AtomicU64,
}

impl ConnectivityMonitor {
    pub const OFFLINE_THRESHOLD: u64 = 3;

    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true), // Assume online until proven otherwise
            failures: AtomicU64::new(0),
        }
    }

    /// Record a completed remote call (accepted or rejected, either way the network worked).
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        if !self.online.swap(true, Ordering::AcqRel) {
            info!("Remote connectivity restored");
            crate::metrics::set_remote_online(true);
        }
    }

    /// Record a transient failure (timeout, connection loss, 5xx).
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= Self::OFFLINE_THRESHOLD && self.online.swap(false, Ordering::AcqRel) {
            warn!(failures, "Remote unreachable, writes stay queued locally");
            crate::metrics::set_remote_online(false);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let monitor = ConnectivityMonitor::new();
        assert!(monitor.is_online());
        assert_eq!(monitor.failure_count(), 0);
    }

    #[test]
    fn test_failure_threshold() {
        let monitor = ConnectivityMonitor::new();

        monitor.record_failure();
        monitor.record_failure();
        assert!(monitor.is_online());
        assert_eq!(monitor.failure_count(), 2);

        monitor.record_failure();
        assert!(!monitor.is_online());
        assert_eq!(monitor.failure_count(), 3);
    }

    #[test]
    fn test_success_resets() {
        let monitor = ConnectivityMonitor::new();
        for _ in 0..5 {
            monitor.record_failure();
        }
        assert!(!monitor.is_online());

        monitor.record_success();
        assert!(monitor.is_online());
        assert_eq!(monitor.failure_count(), 0);
    }
}
