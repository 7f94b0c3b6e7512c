//! Metrics definitions for the indexer.
//!
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "blocks_fetched_total",
        "Total number of blocks fetched from the chain"
    );
    describe_counter!(
        "fetch_retries_total",
        "Total number of per-height fetch retries"
    );
    describe_counter!(
        "records_matched_total",
        "Total number of records matched against watched accounts"
    );
    describe_counter!(
        "checkpoints_advanced_total",
        "Total number of checkpoint advances committed"
    );
    describe_counter!(
        "decode_errors_total",
        "Total number of per-extrinsic decode errors skipped"
    );
    describe_counter!(
        "worker_errors_total",
        "Total number of worker errors surfaced to the controller"
    );
    describe_histogram!(
        "block_processing_duration_seconds",
        "Time from fetch to writer hand-off for a block"
    );
}

/// Record a fetched block.
pub fn record_block_fetched(chain: &str) {
    counter!("blocks_fetched_total", "chain" => chain.to_string()).increment(1);
}

/// Record a fetch retry.
pub fn record_fetch_retry(chain: &str) {
    counter!("fetch_retries_total", "chain" => chain.to_string()).increment(1);
}

/// Record matched records by stream.
pub fn record_records_matched(stream: &str, count: u64) {
    counter!("records_matched_total", "stream" => stream.to_string()).increment(count);
}

/// Record a committed checkpoint advance.
pub fn record_checkpoint_advanced(stream: &str) {
    counter!("checkpoints_advanced_total", "stream" => stream.to_string()).increment(1);
}

/// Record a skipped per-extrinsic decode error.
pub fn record_decode_error(chain: &str) {
    counter!("decode_errors_total", "chain" => chain.to_string()).increment(1);
}

/// Record a worker error surfaced to the controller.
pub fn record_worker_error(kind: &str) {
    counter!("worker_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Record block processing duration.
pub fn record_block_processing_duration(duration_secs: f64) {
    histogram!("block_processing_duration_seconds").record(duration_secs);
}

/// A timer that automatically records duration when dropped.
pub struct ProcessingTimer {
    start: Instant,
}

impl ProcessingTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ProcessingTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessingTimer {
    fn drop(&mut self) {
        record_block_processing_duration(self.start.elapsed().as_secs_f64());
    }
}
