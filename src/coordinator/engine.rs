// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background replay of the mutation queue.
//!
//! One pass:
//!
//! ```text
//! dequeue_batch(n), FIFO
//!     │
//!     ├─→ entity has a failed mutation (or was rejected this pass) → skip
//!     ├─→ next_attempt_at in the future ──────────────────────────→ stop pass
//!     │
//!     ▼
//! mark in_flight → remote call
//!     │
//!     ├─→ ok        → ack + update local store (one transaction), invalidate cache
//!     ├─→ transient → bump_retry with backoff (or failed when exhausted), stop pass
//!     └─→ rejected  → failed, never retried automatically
//! ```
//!
//! Stopping on a transient failure keeps later writes from overtaking an
//! earlier one. Only one pass runs at a time. If the outcome of a remote
//! call cannot be stored locally, the mutation goes back to `queued` and the
//! pass ends with the storage error; the backend may then see it twice.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use super::types::DrainReport;
use crate::cache::{Invalidation, ReadCache};
use crate::entity::{now_millis, LocalEntity, Record};
use crate::queue::{self, MutationMethod, MutationQueue, PendingMutation};
use crate::remote::{RemoteDataSource, RemoteError};
use crate::resilience::health::ConnectivityMonitor;
use crate::resilience::retry::RetryConfig;
use crate::storage::local::{self, LocalStore, WriteOrigin};
use crate::storage::traits::StorageError;

pub struct SyncEngine {
    remote: Arc<dyn RemoteDataSource>,
    local: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    cache: Arc<ReadCache>,
    monitor: Arc<ConnectivityMonitor>,
    retry: RetryConfig,
    batch_size: usize,
    /// Set while a pass runs
    draining: AtomicBool,
    /// Signalled by writes so the loop doesn't wait for the next tick
    wake: Notify,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteDataSource>,
        local: Arc<LocalStore>,
        queue: Arc<MutationQueue>,
        cache: Arc<ReadCache>,
        monitor: Arc<ConnectivityMonitor>,
        retry: RetryConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            remote,
            local,
            queue,
            cache,
            monitor,
            retry,
            batch_size: batch_size.max(1),
            draining: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Ask the run loop for a pass as soon as possible.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replay up to one batch of queued mutations.
    ///
    /// Returns a report with `contended = true` and no work done if another
    /// pass is already running.
    #[tracing::instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainReport, StorageError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            crate::metrics::record_drain_contended();
            return Ok(DrainReport {
                contended: true,
                ..Default::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let start = Instant::now();
        let batch = self.queue.dequeue_batch(self.batch_size).await?;
        let mut report = DrainReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        // Entities whose earlier mutation must land (or be resolved) first
        let mut blocked: HashSet<(String, String)> = self
            .queue
            .failed()
            .await?
            .into_iter()
            .map(|m| (m.collection, m.entity_id))
            .collect();
        // Server ids assigned during this pass, for mutations fetched before the remap
        let mut assigned: HashMap<(String, String), String> = HashMap::new();

        let now = now_millis();
        debug!(batch = batch.len(), blocked = blocked.len(), "Drain pass started");

        for mut mutation in batch {
            if let Some(server_id) = assigned.get(&(mutation.collection.clone(), mutation.entity_id.clone())) {
                mutation.entity_id = server_id.clone();
            }
            let entity_key = (mutation.collection.clone(), mutation.entity_id.clone());

            if blocked.contains(&entity_key) {
                report.skipped += 1;
                continue;
            }
            if mutation.next_attempt_at > now {
                debug!(id = mutation.id, due_in_ms = mutation.next_attempt_at - now, "Head of queue not due yet");
                report.skipped += 1;
                break;
            }

            // Gone or claimed since dequeue (discarded, coalesced)
            if !self.queue.mark_in_flight(mutation.id).await? {
                report.skipped += 1;
                continue;
            }
            report.attempted += 1;

            let outcome = self.dispatch(&mutation).await;
            match self.settle(&mutation, outcome, &mut report, &mut assigned).await {
                Ok(Settled::Continue) => {}
                Ok(Settled::Block) => {
                    blocked.insert(entity_key);
                }
                Ok(Settled::Stop) => break,
                Err(e) => {
                    self.release(&mutation).await;
                    return Err(e);
                }
            }
        }

        self.publish_queue_stats().await;
        crate::metrics::record_drain(report.attempted, start.elapsed());
        if !report.is_idle() {
            info!(
                attempted = report.attempted,
                acked = report.acked,
                retried = report.retried,
                failed = report.failed,
                skipped = report.skipped,
                "Drain pass complete"
            );
        }
        Ok(report)
    }

    /// Drain until a pass makes no progress.
    pub async fn drain_all(&self) -> Result<DrainReport, StorageError> {
        let mut total = DrainReport::default();
        loop {
            let pass = self.drain_once().await?;
            total.absorb(pass);
            if pass.contended || pass.acked == 0 || pass.retried > 0 {
                return Ok(total);
            }
        }
    }

    /// Run the periodic drain loop until `shutdown` turns true or its sender drops.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "Sync engine drain loop running");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.drain_logged().await;
                }

                _ = self.wake.notified() => {
                    self.drain_logged().await;
                }
            }
        }

        info!("Sync engine drain loop stopped");
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.drain_once().await {
            error!(error = %e, "Drain pass failed on local storage");
        }
    }

    /// Record the remote outcome of one in-flight mutation.
    async fn settle(
        &self,
        mutation: &PendingMutation,
        outcome: Result<Option<Record>, RemoteError>,
        report: &mut DrainReport,
        assigned: &mut HashMap<(String, String), String>,
    ) -> Result<Settled, StorageError> {
        let method = mutation.method.as_str();
        match outcome {
            Ok(confirmed) => {
                self.monitor.record_success();
                crate::metrics::record_remote_call(remote_op(mutation.method), "ok");
                if let Some(server_id) = self.apply_ack(mutation, confirmed).await? {
                    assigned.insert((mutation.collection.clone(), mutation.entity_id.clone()), server_id);
                }
                crate::metrics::record_mutation_outcome(method, "acked");
                report.acked += 1;
                Ok(Settled::Continue)
            }
            Err(e) if e.is_transient() => {
                self.monitor.record_failure();
                crate::metrics::record_remote_call(remote_op(mutation.method), "transient");

                let attempts = mutation.retries + 1;
                if self.retry.exhausted(attempts) {
                    let reason = format!("gave up after {} attempts: {}", attempts, e);
                    self.queue.mark_failed(mutation.id, &reason).await?;
                    warn!(id = mutation.id, method, entity_id = %mutation.entity_id, attempts, error = %e, "Mutation out of retries");
                    crate::metrics::record_mutation_outcome(method, "failed");
                    report.failed += 1;
                } else {
                    let delay = self.retry.delay_for_attempt(attempts);
                    let next_attempt_at = now_millis() + delay.as_millis() as i64;
                    self.queue.bump_retry(mutation.id, next_attempt_at, &e.to_string()).await?;
                    info!(id = mutation.id, method, attempts, retry_in = ?delay, error = %e, "Mutation deferred");
                    crate::metrics::record_mutation_outcome(method, "retried");
                    report.retried += 1;
                }
                Ok(Settled::Stop)
            }
            Err(e) => {
                self.monitor.record_success();
                crate::metrics::record_remote_call(remote_op(mutation.method), "rejected");
                self.queue.mark_failed(mutation.id, &e.to_string()).await?;
                warn!(id = mutation.id, method, entity_id = %mutation.entity_id, error = %e, "Mutation rejected");
                crate::metrics::record_mutation_outcome(method, "failed");
                report.failed += 1;
                Ok(Settled::Block)
            }
        }
    }

    /// Hand a mutation whose outcome could not be stored back to the queue,
    /// so the next pass replays it instead of leaving it in flight.
    async fn release(&self, mutation: &PendingMutation) {
        match self.queue.requeue(mutation.id).await {
            Ok(_) => warn!(id = mutation.id, entity_id = %mutation.entity_id, "Mutation outcome not stored, requeued"),
            Err(e) => error!(id = mutation.id, error = %e, "Mutation stuck in flight until restart"),
        }
    }

    async fn dispatch(&self, mutation: &PendingMutation) -> Result<Option<Record>, RemoteError> {
        let collection = mutation.collection.as_str();
        debug!(id = mutation.id, "{} {}", mutation.method.http_verb(), mutation.endpoint);
        let body = || {
            mutation
                .body
                .as_ref()
                .filter(|b| b.is_object())
                .ok_or_else(|| RemoteError::rejected(400, "mutation has no row body"))
        };

        match mutation.method {
            MutationMethod::Create => self.remote.insert(collection, body()?).await.map(Some),
            MutationMethod::Update | MutationMethod::Delete if mutation.entity_id.starts_with(crate::entity::LOCAL_ID_PREFIX) => {
                // Its create never reached the backend
                Err(RemoteError::rejected(409, "entity was never created remotely"))
            }
            MutationMethod::Update => self.remote.update(collection, &mutation.entity_id, body()?).await.map(Some),
            MutationMethod::Delete => self.remote.delete(collection, &mutation.entity_id).await.map(|_| None),
        }
    }

    /// Commit a confirmed mutation locally. Returns the server id when a
    /// create rekeyed its entity.
    async fn apply_ack(&self, mutation: &PendingMutation, confirmed: Option<Record>) -> Result<Option<String>, StorageError> {
        let collection = mutation.collection.as_str();
        self.local.ensure_collection(collection).await?;

        let mut tx = self.local.begin_write().await?;
        queue::ack_on(&mut tx, mutation.id).await?;

        let mut entity_id = mutation.entity_id.clone();
        let mut assigned = None;

        if let (MutationMethod::Create, Some(record)) = (mutation.method, confirmed.as_ref()) {
            if record.id != entity_id {
                local::rekey_on(&mut tx, collection, &entity_id, &record.id).await?;
                queue::remap_entity_on(&mut tx, collection, &entity_id, &record.id).await?;
                assigned = Some(record.id.clone());
                entity_id = record.id.clone();
            }
        }

        let remaining = queue::pending_for_entity_on(&mut tx, collection, &entity_id).await?;
        let current = local::get_on(&mut tx, collection, &entity_id).await?;

        match (mutation.method, confirmed) {
            (MutationMethod::Delete, _) => {
                if remaining.is_empty() {
                    local::delete_on(&mut tx, collection, &entity_id).await?;
                }
            }
            (_, Some(record)) if remaining.is_empty() => {
                // Nothing newer is pending: the server's row is the truth
                local::put_on(&mut tx, &LocalEntity::from_record(collection, &record), WriteOrigin::Confirmed).await?;
            }
            (_, Some(record)) => {
                // Later edits still queued; keep them, adopt the server's creation time
                if let Some(mut entity) = current {
                    entity.created_at = record.created_at;
                    local::put_on(&mut tx, &entity, WriteOrigin::Local).await?;
                }
            }
            (_, None) => {}
        }

        tx.commit().await?;

        self.cache.invalidate(Invalidation::Collection(collection.to_string())).await;
        debug!(
            id = mutation.id,
            method = mutation.method.as_str(),
            entity_id = %entity_id,
            remaining = remaining.len(),
            "Mutation acknowledged"
        );
        Ok(assigned)
    }

    async fn publish_queue_stats(&self) {
        match self.queue.stats().await {
            Ok(stats) => {
                crate::metrics::set_queue_depth(stats.pending());
                crate::metrics::set_failed_mutations(stats.failed);
            }
            Err(e) => debug!(error = %e, "Queue stats unavailable"),
        }
    }
}

/// What a pass does after one mutation.
enum Settled {
    Continue,
    /// Rejected: later mutations of the entity wait for manual resolution
    Block,
    /// Deferred: nothing behind it may overtake it
    Stop,
}

fn remote_op(method: MutationMethod) -> &'static str {
    match method {
        MutationMethod::Create => "insert",
        MutationMethod::Update => "update",
        MutationMethod::Delete => "delete",
    }
}

/// RAII guard to reset draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
