//! Metrics module
//!
//! Prometheus counters and histograms for upload lifecycle and chunk writes.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec,
};

lazy_static! {
    // Upload lifecycle metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "uploadr_uploads_total",
        "Upload lifecycle transitions",
        &["event"]  // "created", "completed", "deleted"
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "uploadr_upload_bytes_total",
        "Total payload bytes durably written"
    ).unwrap();

    // Chunk metrics
    pub static ref CHUNK_WRITE_DURATION: HistogramVec = register_histogram_vec!(
        "uploadr_chunk_write_duration_seconds",
        "Chunk write duration in seconds",
        &["outcome"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    pub static ref OFFSET_CONFLICTS: Counter = register_counter!(
        "uploadr_offset_conflicts_total",
        "Chunks rejected because their start did not match the upload offset"
    ).unwrap();

    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "uploadr_requests_total",
        "Requests handled per protocol and method",
        &["protocol", "method"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "uploadr_errors_total",
        "Error responses by code",
        &["code"]
    ).unwrap();
}

/// Record an upload lifecycle event
pub fn record_upload_event(event: &str) {
    UPLOADS_TOTAL.with_label_values(&[event]).inc();
}

/// Record a chunk write
///
/// # Arguments
/// * `bytes` - Bytes durably written by the chunk
/// * `duration_secs` - Time spent streaming and syncing
/// * `success` - Whether the write completed without error
pub fn record_chunk_write(bytes: u64, duration_secs: f64, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    CHUNK_WRITE_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a rejected chunk offset
pub fn record_offset_conflict() {
    OFFSET_CONFLICTS.inc();
}

/// Record a dispatched request
pub fn record_request(protocol: &str, method: &str) {
    REQUESTS_TOTAL.with_label_values(&[protocol, method]).inc();
}

/// Record an error response
pub fn record_error(code: &str) {
    ERRORS_TOTAL.with_label_values(&[code]).inc();
}
