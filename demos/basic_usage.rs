// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic doc-engine usage example.
//!
//! Demonstrates:
//! 1. Starting an in-memory database
//! 2. Writing, updating and deleting documents
//! 3. Importing a replicated conflict and reading `_conflicts`
//! 4. One-shot and live changes feeds
//! 5. A reduced map/reduce view and `all_docs`
//! 6. Displaying captured metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

use doc_engine::changes::{ChangesCallbacks, ChangesOptions, Since};
use doc_engine::views::{QueryOptions, Reducer, ViewDefinition};
use doc_engine::{Database, DocEngineConfig, GetOptions, PutOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the engine records)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           doc-engine: Basic Usage Example                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Starting database...");
    let config = DocEngineConfig {
        name: "pantry".into(),
        ..Default::default()
    };
    let db = Database::in_memory(config).await?;
    println!("   └─ State: {}", db.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing documents...");
    let entries = [
        ("apple", json!({"kind": "fruit", "qty": 3})),
        ("pear", json!({"kind": "fruit", "qty": 1})),
        ("leek", json!({"kind": "veg", "qty": 2})),
        ("salt", json!({"kind": "spice", "qty": 1})),
    ];
    for (id, body) in &entries {
        let mut doc = body.clone();
        doc["_id"] = json!(id);
        let resp = db.put(doc).await?;
        println!("   └─ {} → {}", resp.id, resp.rev);
    }

    let apple = db.get("apple", &GetOptions::default()).await?;
    let mut updated = apple.clone();
    updated["qty"] = json!(5);
    let resp = db.put(updated).await?;
    println!("   └─ apple updated → {}", resp.rev);

    match db.put(apple).await {
        Ok(_) => println!("   └─ ⚠️  stale write accepted"),
        Err(e) => println!("   └─ stale write rejected: {} ({})", e.name(), e.status()),
    }

    let salt = db.get("salt", &GetOptions::default()).await?;
    let rev = salt["_rev"].as_str().unwrap_or_default().to_string();
    db.remove("salt", &rev).await?;
    println!("   └─ salt removed");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Replicated conflict
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔀 Importing two replicas of 'fig'...");
    let replicated = PutOptions { new_edits: false };
    db.put_with(json!({"_id": "fig", "_rev": "1-aaaa", "kind": "fruit", "qty": 2}), replicated)
        .await?;
    db.put_with(json!({"_id": "fig", "_rev": "1-bbbb", "kind": "fruit", "qty": 4}), replicated)
        .await?;
    let opts = GetOptions {
        conflicts: true,
        ..Default::default()
    };
    let fig = db.get("fig", &opts).await?;
    println!("   └─ winner {} conflicts {}", fig["_rev"], fig["_conflicts"]);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Changes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📜 Changes since 0:");
    let changes = db.changes(&ChangesOptions::new()).await?;
    for row in &changes.results {
        let flag = if row.deleted { " (deleted)" } else { "" };
        println!("   └─ seq {} {}{}", row.seq, row.id, flag);
    }
    println!("   last_seq = {}", changes.last_seq);

    println!("\n📡 Live feed (next 2 changes)...");
    let handle = db.live_changes(
        ChangesOptions::new().since(Since::Now).limit(2),
        ChangesCallbacks::new().on_change(|row, _| println!("   └─ live: seq {} {}", row.seq, row.id)),
    )?;
    db.put(json!({"_id": "kale", "kind": "veg", "qty": 6})).await?;
    db.put(json!({"_id": "plum", "kind": "fruit", "qty": 2})).await?;
    let summary = tokio::time::timeout(Duration::from_secs(5), handle.finished()).await??;
    println!("   └─ feed {} after {} rows", summary.status.as_str(), summary.delivered);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Views
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔎 Quantity by kind:");
    let by_kind = ViewDefinition::new("qty_by_kind", |doc, emit| {
        if let (Some(kind), Some(qty)) = (doc.get("kind"), doc.get("qty")) {
            emit.emit(kind.clone(), qty.clone());
        }
    })
    .with_reduce(Reducer::Sum);
    let res = db.query(&by_kind, &QueryOptions::new().group(true)).await?;
    for row in &res.rows {
        println!("   └─ {} = {}", row.key, row.value);
    }

    let all = db.all_docs(&QueryOptions::new()).await?;
    println!("\n📚 all_docs ({} rows): {:?}", all.total_rows, all.ids());

    let info = db.info()?;
    println!("\nℹ️  {} docs={} update_seq={}", info.db_name, info.doc_count, info.update_seq);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Closing...");
    db.close().await;
    println!("   ✅ Closed! State: {}", db.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(f64::NEG_INFINITY, f64::max);
                histograms.push((name, label_str, count, sum, max));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, sum, max) in &histograms {
            if *count == 0 {
                println!("   │  └─ {}{} = (no samples)", name, labels);
            } else {
                println!("   │  └─ {}{}", name, labels);
                println!("   │     count={} sum={:.4} max={:.4}", count, sum, max);
            }
        }
    }

    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
