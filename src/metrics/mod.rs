//! Metrics module
//!
//! Prometheus counters and histograms for upload session activity, exposed
//! on the `/metrics` route of the main listener.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Session lifecycle
    pub static ref SESSIONS_TOTAL: CounterVec = register_counter_vec!(
        "tus_sessions_total",
        "Upload sessions by lifecycle event",
        &["status"]  // "created", "completed", "aborted"
    ).unwrap();

    // Append activity
    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "tus_upload_bytes_total",
        "Total bytes accepted across all sessions"
    ).unwrap();

    pub static ref APPEND_DURATION: HistogramVec = register_histogram_vec!(
        "tus_append_duration_seconds",
        "Append handling duration in seconds",
        &["outcome"],  // "success" or "failure"
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    pub static ref PARTS_PER_UPLOAD: Histogram = register_histogram!(
        "tus_parts_per_upload",
        "Number of storage parts per completed upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Auth
    pub static ref AUTH_ATTEMPTS: CounterVec = register_counter_vec!(
        "tus_auth_attempts_total",
        "Identity service authorization attempts",
        &["status"]
    ).unwrap();

    // Errors
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "tus_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a newly created session
pub fn record_session_created() {
    SESSIONS_TOTAL.with_label_values(&["created"]).inc();
}

/// Record a completed upload and its part count
pub fn record_session_completed(parts_count: usize) {
    SESSIONS_TOTAL.with_label_values(&["completed"]).inc();
    PARTS_PER_UPLOAD.observe(parts_count as f64);
}

/// Record a cancelled upload
pub fn record_session_aborted() {
    SESSIONS_TOTAL.with_label_values(&["aborted"]).inc();
}

/// Record bytes accepted by a successful append
pub fn record_append(bytes: u64, duration_secs: f64) {
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
    APPEND_DURATION
        .with_label_values(&["success"])
        .observe(duration_secs);
}

/// Record a failed append
pub fn record_append_failure(duration_secs: f64) {
    APPEND_DURATION
        .with_label_values(&["failure"])
        .observe(duration_secs);
}

/// Record an authorization attempt
pub fn record_auth_attempt(success: bool) {
    let status = if success { "success" } else { "failure" };
    AUTH_ATTEMPTS.with_label_values(&[status]).inc();
}

/// Record an error by type
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render the default registry in Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_session_lifecycle() {
        record_session_created();
        record_session_completed(13);
        record_session_aborted();
        // Just verify it doesn't panic
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        record_append(1024, 0.01);
        let text = render();
        assert!(text.contains("tus_upload_bytes_total"));
    }
}
