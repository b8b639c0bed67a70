//! Metrics definitions for the Room Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rc_` prefix for Room Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, room, session)
//! - `request`: bounded by signaling methods (6 values + `malformed`)
//! - `status`: `ok` or an `ErrorCode` name (14 values)
//! - `operation`: bounded by engine calls (~8 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Engine calls are local IPC in production, create_transport can take longer
        .set_buckets_for_metric(
            Matcher::Prefix("rc_engine_call".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine call buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("rc_signaling_request_duration".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Session Metrics (Gauges)
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `rc_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_rooms_active").set(count as f64);
}

/// Set the number of connected signaling sessions.
///
/// Metric: `rc_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_sessions_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `rc_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room, session)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a handled signaling request.
///
/// Metric: `rc_signaling_requests_total`, `rc_signaling_request_duration_seconds`
/// Labels: `request`, `status`
pub fn record_signaling_request(request: &str, status: &str, duration: Duration) {
    counter!("rc_signaling_requests_total",
        "request" => request.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("rc_signaling_request_duration_seconds", "request" => request.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Engine Metrics
// ============================================================================

/// Record the duration of a media engine call.
///
/// Metric: `rc_engine_call_duration_seconds`
/// Labels: `operation`, `outcome` (ok, error, timeout, cancelled)
pub fn record_engine_call(operation: &str, outcome: &str, duration: Duration) {
    histogram!("rc_engine_call_duration_seconds",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a media engine worker death.
///
/// Metric: `rc_worker_deaths_total`
///
/// ALERT: Each death fails every room the worker hosted.
pub fn record_worker_death() {
    counter!("rc_worker_deaths_total").increment(1);
}

/// Record an actor panic event.
///
/// Metric: `rc_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("rc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record messages dropped due to backpressure.
///
/// Metric: `rc_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("rc_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run against the global no-op recorder; they exercise the
    // recording paths without asserting values.

    #[test]
    fn test_set_gauges() {
        set_rooms_active(0);
        set_rooms_active(12);
        set_sessions_active(0);
        set_sessions_active(40);
        set_actor_mailbox_depth("registry", 0);
        set_actor_mailbox_depth("room", 50);
        set_actor_mailbox_depth("session", 200);
    }

    #[test]
    fn test_record_signaling_request() {
        record_signaling_request("joinRoom", "ok", Duration::from_millis(4));
        record_signaling_request("produce", "AlreadyProducing", Duration::from_millis(1));
        record_signaling_request("malformed", "InvalidRequest", Duration::ZERO);
    }

    #[test]
    fn test_record_engine_metrics() {
        record_engine_call("create_router", "ok", Duration::from_millis(2));
        record_engine_call("consume", "timeout", Duration::from_secs(10));
        record_worker_death();
    }

    #[test]
    fn test_record_actor_events() {
        record_actor_panic("room");
        record_message_dropped("session");
    }

    #[test]
    fn test_metric_names_are_exported() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_rooms_active(3);
            set_sessions_active(7);
            record_signaling_request("joinRoom", "ok", Duration::from_millis(4));
            record_engine_call("create_router", "ok", Duration::from_millis(2));
            record_worker_death();
            record_actor_panic("room");
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "rc_rooms_active",
            "rc_sessions_active",
            "rc_signaling_requests_total",
            "rc_signaling_request_duration_seconds",
            "rc_engine_call_duration_seconds",
            "rc_worker_deaths_total",
            "rc_actor_panics_total",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }
    }
}
