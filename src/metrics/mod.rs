//! Metrics module
//!
//! Prometheus metrics for uploads, parts, retries and aborts. The CLI is
//! short-lived, so metrics are exported through a node-exporter textfile
//! (see [`textfile`]) instead of a scrape endpoint.

pub mod textfile;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Histogram, HistogramVec,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "kumo_uploads_total",
        "Total number of uploads",
        &["method", "status"]
    ).unwrap();

    pub static ref UPLOAD_FAILURES: CounterVec = register_counter_vec!(
        "kumo_upload_failures_total",
        "Failed uploads by cause",
        &["method", "reason"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "kumo_upload_bytes_total",
        "Total bytes of completed uploads"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "kumo_upload_duration_seconds",
        "Upload duration in seconds",
        &["method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0]
    ).unwrap();

    // Part metrics
    pub static ref PARTS_TOTAL: CounterVec = register_counter_vec!(
        "kumo_parts_total",
        "Uploaded parts by final status",
        &["status"]
    ).unwrap();

    pub static ref PART_BYTES_TOTAL: Counter = register_counter!(
        "kumo_part_bytes_total",
        "Bytes accepted as parts"
    ).unwrap();

    pub static ref PART_DURATION: Histogram = register_histogram!(
        "kumo_part_duration_seconds",
        "Part upload duration in seconds, including retries",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref PART_RETRIES: CounterVec = register_counter_vec!(
        "kumo_part_retries_total",
        "Part attempts repeated, by reason",
        &["reason"]
    ).unwrap();

    pub static ref REUSED_PARTS: Counter = register_counter!(
        "kumo_reused_parts_total",
        "Parts kept from an earlier attempt when resuming"
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "kumo_multipart_parts",
        "Number of parts per completed multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]
    ).unwrap();

    pub static ref ABORTS_TOTAL: CounterVec = register_counter_vec!(
        "kumo_aborts_total",
        "Multipart upload aborts",
        &["status"]
    ).unwrap();
}

/// Record a completed upload
pub fn record_upload_success(method: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[method, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(method: &str, reason: &str) {
    UPLOADS_TOTAL.with_label_values(&[method, "failure"]).inc();
    UPLOAD_FAILURES.with_label_values(&[method, reason]).inc();
}

/// Record upload duration
pub fn record_upload_duration(method: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record a part accepted by the service
pub fn record_part_success(bytes: u64, duration_secs: f64) {
    PARTS_TOTAL.with_label_values(&["success"]).inc();
    PART_BYTES_TOTAL.inc_by(bytes as f64);
    PART_DURATION.observe(duration_secs);
}

/// Record a part that failed terminally
pub fn record_part_failure(reason: &str) {
    PARTS_TOTAL.with_label_values(&[reason]).inc();
}

/// Record a repeated part attempt
pub fn record_part_retry(reason: &str) {
    PART_RETRIES.with_label_values(&[reason]).inc();
}

/// Record parts reused by a resumed upload
pub fn record_reused_parts(count: usize) {
    REUSED_PARTS.inc_by(count as f64);
}

/// Record the part count of a completed multipart upload
pub fn record_multipart_parts(parts_count: usize) {
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record an abort attempt
pub fn record_abort(success: bool) {
    let status = if success { "success" } else { "failure" };
    ABORTS_TOTAL.with_label_values(&[status]).inc();
}
