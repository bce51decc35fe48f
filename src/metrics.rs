// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the mirror.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `table_mirror_` prefix for all metrics
//! - `_total` suffix for counters
//!
//! # Labels
//! - `tablename`: the remote table
//! - `operation`: get, get_all, insert, update
//! - `outcome`: hit, stale, miss, not_found

use metrics::{counter, histogram};

use crate::record::UpsertStats;

/// Record a call that actually went to the remote service.
pub fn record_remote_call(tablename: &str, operation: &str) {
    counter!(
        "table_mirror_remote_calls_total",
        "tablename" => tablename.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record how a mirror-backed point read resolved.
pub fn record_cache_read(tablename: &str, outcome: &str) {
    counter!(
        "table_mirror_cache_reads_total",
        "tablename" => tablename.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an upsert batch's insert/update split.
pub fn record_upsert(tablename: &str, stats: &UpsertStats) {
    counter!(
        "table_mirror_rows_inserted_total",
        "tablename" => tablename.to_string()
    )
    .increment(stats.inserted as u64);
    counter!(
        "table_mirror_rows_updated_total",
        "tablename" => tablename.to_string()
    )
    .increment(stats.updated as u64);
    histogram!(
        "table_mirror_upsert_batch_size",
        "tablename" => tablename.to_string()
    )
    .record(stats.total as f64);
}

/// Record a table skipped by the change-summary short-circuit.
pub fn record_short_circuit(tablename: &str) {
    counter!(
        "table_mirror_short_circuits_total",
        "tablename" => tablename.to_string()
    )
    .increment(1);
}
