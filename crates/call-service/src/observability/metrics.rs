//! Metrics definitions for the call service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `call_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `media_kind`: 2 values (audio, video)
//! - `reason`: bounded by `EndReason` (8 values)
//! - `field`: 3 values (offerPayload, answerPayload, status)
//! - `status`: bounded write outcomes (written, ignored, error)
//! - `operation`: 3 values (initiate, answer, decline)
//! - `error`: bounded by `CallError::reason_code` (11 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle used to
/// render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling writes are single Redis script calls (p99 < 10ms expected)
        .set_buckets_for_metric(
            Matcher::Prefix("call_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling write buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Set the number of live call sessions.
///
/// Metric: `call_sessions_active`
/// Labels: none
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic session counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("call_sessions_active").set(count as f64);
}

/// Record an outgoing call.
///
/// Metric: `call_initiated_total`
/// Labels: `media_kind`
pub fn record_call_initiated(media_kind: &str) {
    counter!("call_initiated_total", "media_kind" => media_kind.to_string()).increment(1);
}

/// Record an answered incoming call.
///
/// Metric: `call_answered_total`
pub fn record_call_answered() {
    counter!("call_answered_total").increment(1);
}

/// Record a declined incoming call.
///
/// Metric: `call_declined_total`
pub fn record_call_declined() {
    counter!("call_declined_total").increment(1);
}

/// Record a session reaching its terminal state.
///
/// Metric: `call_session_ended_total`
/// Labels: `reason`
///
/// Cardinality: 8 (bounded by `EndReason`)
pub fn record_session_ended(reason: &str) {
    counter!("call_session_ended_total", "reason" => reason.to_string()).increment(1);
}

/// Record a failed `initiate`, `answer` or `decline`.
///
/// Metric: `call_operation_failures_total`
/// Labels: `operation`, `error`
///
/// Cardinality: 33 (3 operations x 11 error codes)
pub fn record_operation_failure(operation: &str, error: &str) {
    counter!("call_operation_failures_total",
        "operation" => operation.to_string(),
        "error" => error.to_string()
    )
    .increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a signaling field write.
///
/// Metric: `call_signaling_write_seconds`
/// Labels: `field`, `status` (written, ignored, error)
///
/// Cardinality: 9 (3 fields x 3 statuses)
pub fn record_signaling_write(field: &str, status: &str, duration: Duration) {
    histogram!("call_signaling_write_seconds",
        "field" => field.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an incoming-call notification delivered to the application.
///
/// Metric: `call_incoming_notifications_total`
///
/// Duplicates are counted: the watcher does not deduplicate.
pub fn record_incoming_notification() {
    counter!("call_incoming_notifications_total").increment(1);
}
