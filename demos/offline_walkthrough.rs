// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline walkthrough example.
//!
//! Demonstrates:
//! 1. Writing tasks while the backend is unreachable
//! 2. Reading the merged view offline (local ids, pending state)
//! 3. Reconnecting and draining the mutation queue
//! 4. A rejected write and its manual resolution
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! Runs against the in-memory backend; nothing to start first.
//!
//! # Run
//!
//! ```bash
//! cargo run --example offline_walkthrough
//! ```

use std::sync::Arc;

use care_sync::remote::memory::RemoteOp;
use care_sync::{InMemoryRemote, MergedView, RemoteError, SyncClient, SyncConfig, WriteRequest};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

const PATIENT: &str = "patient-7";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "care_sync=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           care-sync: Offline Walkthrough                      ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open the client against a backend that is down
    // ─────────────────────────────────────────────────────────────────────────
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_offline(true);

    let config = SyncConfig {
        cacheable: [("tasks".to_string(), Some(30))].into_iter().collect(),
        retry_initial_ms: 0,
        ..Default::default()
    };
    let client = SyncClient::open(config, remote.clone()).await?;
    println!("📦 Client opened (state: {})", client.state());

    println!("\n📝 Writing three tasks with no connectivity...");
    let mut ids = Vec::new();
    for title in ["Morning meds", "Walk 20 min", "Log mood"] {
        let task = client
            .write("tasks", WriteRequest::create(PATIENT, json!({ "title": title })))
            .await?;
        println!("   └─ {} → {}", title, task.id);
        ids.push(task.id);
    }

    client
        .write("tasks", WriteRequest::update(&ids[1], PATIENT, json!({ "title": "Walk 30 min" })))
        .await?;
    println!("   └─ Edited {} while still offline", ids[1]);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Offline read
    // ─────────────────────────────────────────────────────────────────────────
    print_view("Offline view", &client.merged_view("tasks", PATIENT).await?);

    let report = client.sync_now().await?;
    println!("\n⏳ Drain while offline: {:?}", report);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Reconnect
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Connectivity restored");
    remote.set_offline(false);

    // One more hiccup before the backend answers
    remote.fail_next(Some(RemoteOp::Insert), RemoteError::transient("gateway timeout"));
    let report = client.sync_now().await?;
    println!("   └─ First drain: {:?}", report);
    let report = client.sync_now().await?;
    println!("   └─ Second drain: {:?}", report);

    print_view("Online view", &client.merged_view("tasks", PATIENT).await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Rejection and manual resolution
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚫 Writing a task the backend will reject...");
    client.start();
    remote.fail_next(Some(RemoteOp::Insert), RemoteError::rejected(422, "title too long"));
    client
        .write("tasks", WriteRequest::create(PATIENT, json!({ "title": "x".repeat(500) })))
        .await?;

    // The background loop picks the write up on its own
    let mut failed = Vec::new();
    for _ in 0..50 {
        failed = client.failed_mutations().await?;
        if !failed.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    for m in &failed {
        println!(
            "   └─ #{} {} {} failed: {}",
            m.id,
            m.method.as_str(),
            m.entity_id,
            m.last_error.as_deref().unwrap_or("?")
        );
        client.discard_failed(m.id).await?;
        println!("      discarded");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Status and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let status = client.status().await?;
    println!("\n📊 Status");
    println!("   ├─ State: {}", status.state);
    println!("   ├─ Online: {} (consecutive failures: {})", status.online, status.remote_failures);
    println!("   ├─ Queue: {} pending, {} failed", status.queue.pending(), status.queue.failed);
    println!(
        "   └─ Cache: {} hits, {} misses ({:.0}% hit rate)",
        status.cache.hits,
        status.cache.misses,
        status.cache.hit_rate * 100.0
    );

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    client.shutdown().await;
    println!("   ✅ State: {}", client.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn print_view(title: &str, view: &MergedView) {
    println!(
        "\n📖 {} ({} entities, offline={}, from_cache={})",
        title,
        view.len(),
        view.offline,
        view.from_cache
    );
    for entity in &view.entities {
        println!(
            "   └─ {:<44} {:<8} {:?} {}",
            entity.id, entity.sync_state, entity.origin, entity.payload
        );
    }
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };

        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} sum={:.4}", samples.len(), sum)
            }
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
