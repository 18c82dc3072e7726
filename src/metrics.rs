// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for doc-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for installing a recorder
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `doc_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: put, post, get, remove, bulk, query, all_docs, changes
//! - `status`: success, conflict, invalid, not_found, error
//! - `view`: view name for index metrics

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::error::DocError;

/// Record a document operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "doc_engine_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a document operation from its result
pub fn record_result<T>(operation: &str, result: &Result<T, DocError>) {
    let status = match result {
        Ok(_) => "success",
        Err(DocError::RevConflict { .. }) => "conflict",
        Err(DocError::MissingDoc { .. }) => "not_found",
        Err(DocError::Backend(_)) => "error",
        Err(_) => "invalid",
    };
    record_operation(operation, status);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "doc_engine_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record number of documents in one bulk call
pub fn record_bulk_size(count: usize) {
    histogram!("doc_engine_bulk_docs").record(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// Database gauges
// ═══════════════════════════════════════════════════════════════════════════

/// Set the latest assigned sequence number
pub fn set_update_seq(seq: u64) {
    gauge!("doc_engine_update_seq").set(seq as f64);
}

/// Set the number of non-deleted documents
pub fn set_doc_count(count: usize) {
    gauge!("doc_engine_doc_count").set(count as f64);
}

/// Record a lifecycle transition
pub fn set_engine_state(state: &str) {
    counter!(
        "doc_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record duration of a startup phase
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "doc_engine_startup_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record revisions whose bodies were dropped by compaction
pub fn record_compaction(revisions: usize) {
    counter!("doc_engine_compacted_revisions_total").increment(revisions as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// Error metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record a backend failure
pub fn record_backend_error(operation: &str) {
    counter!(
        "doc_engine_backend_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Changes feed metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record rows delivered by a changes feed
pub fn record_changes_delivered(mode: &str, count: usize) {
    counter!(
        "doc_engine_changes_delivered_total",
        "mode" => mode.to_string()
    )
    .increment(count as u64);
}

/// Set the number of running live feeds
pub fn set_live_feeds(count: usize) {
    gauge!("doc_engine_live_feeds").set(count as f64);
}

/// Record how a live feed ended
pub fn record_feed_finished(status: &str) {
    counter!(
        "doc_engine_feeds_finished_total",
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// View metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record an incremental index refresh
pub fn record_view_refresh(view: &str, docs: usize, duration: Duration) {
    counter!(
        "doc_engine_view_docs_indexed_total",
        "view" => view.to_string()
    )
    .increment(docs as u64);
    histogram!(
        "doc_engine_view_refresh_seconds",
        "view" => view.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record rows returned by a view query
pub fn record_view_rows(view: &str, rows: usize) {
    histogram!(
        "doc_engine_view_rows",
        "view" => view.to_string()
    )
    .record(rows as f64);
}

/// Set the number of live view indexes
pub fn set_view_indexes(count: usize) {
    gauge!("doc_engine_view_indexes").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// Latency timer
// ═══════════════════════════════════════════════════════════════════════════

/// Records the elapsed time for `operation` when dropped.
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
