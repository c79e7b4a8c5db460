// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the satellite.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `satellite_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `optype`: INSERT, UPDATE, DELETE
//! - `outcome`: applied, skipped_duplicate
//! - `origin`: local, remote, snapshot

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an appended oplog entry
pub fn record_oplog_append(optype: &str) {
    counter!(
        "satellite_oplog_appends_total",
        "optype" => optype.to_string()
    )
    .increment(1);
}

/// Record the outcome of one causal merge
pub fn record_merge(origin: &str, outcome: &str) {
    counter!(
        "satellite_merges_total",
        "origin" => origin.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record batch application latency
pub fn record_apply_latency(origin: &str, duration: Duration) {
    histogram!(
        "satellite_apply_seconds",
        "origin" => origin.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a rejected (malformed) remote batch
pub fn record_rejected_batch(reason: &str) {
    counter!(
        "satellite_rejected_batches_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set connectivity status (0 = disconnected, 1 = connecting, 2 = connected, 3 = error)
pub fn set_connectivity_status(status: u8) {
    gauge!("satellite_connectivity_status").set(status as f64);
}

/// Record a failed connection attempt
pub fn record_reconnect_attempt(kind: &str) {
    counter!(
        "satellite_connect_failures_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Set number of tracked shapes
pub fn set_active_shapes(count: usize) {
    gauge!("satellite_shapes").set(count as f64);
}

/// Record shape status transition
pub fn record_shape_transition(status: &str) {
    counter!(
        "satellite_shape_transitions_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record entries sent to the remote side
pub fn record_pushed(count: usize) {
    counter!("satellite_pushed_entries_total").increment(count as u64);
}

/// Record acknowledged entries removed from the oplog
pub fn record_compacted(count: u64) {
    counter!("satellite_compacted_entries_total").increment(count);
}

/// Record migrations applied at start-up
pub fn record_migrations(count: usize) {
    counter!("satellite_migrations_applied_total").increment(count as u64);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "satellite_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
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

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the calls don't panic without an installed recorder.

    #[test]
    fn test_counters() {
        record_oplog_append("INSERT");
        record_merge("remote", "applied");
        record_merge("remote", "skipped_duplicate");
        record_rejected_batch("malformed");
        record_reconnect_attempt("transient");
        record_shape_transition("synced");
        record_pushed(10);
        record_compacted(10);
        record_migrations(2);
    }

    #[test]
    fn test_gauges_and_histograms() {
        set_connectivity_status(2);
        set_active_shapes(3);
        record_apply_latency("remote", Duration::from_millis(3));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("write");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
