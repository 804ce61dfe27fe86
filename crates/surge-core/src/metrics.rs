//! Process-wide Prometheus metrics for a run.
//!
//! Metrics are registered lazily on first access using once_cell::Lazy and
//! can be dumped in text exposition format with [`export_prometheus`].

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::{CoreError, CoreResult};
use crate::outcome::RequestOutcome;

// ===== Request Metrics =====

/// Performed steps by tag and check result
pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "surge_requests_total",
        "Total number of requests issued by virtual users",
        &["tag", "result"]
    )
    .expect("Failed to register request counter")
});

/// Request duration histogram
pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "surge_request_duration_seconds",
        "Request duration in seconds",
        &["tag"],
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register request duration histogram")
});

// ===== Executor Metrics =====

/// Virtual users currently running
pub static ACTIVE_VUS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("surge_active_vus", "Number of active virtual users")
        .expect("Failed to register active VU gauge")
});

/// Completed iterations across all virtual users
pub static ITERATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "surge_iterations_total",
        "Total number of completed iterations"
    )
    .expect("Failed to register iterations counter")
});

/// Mirror one outcome into the Prometheus registry.
pub fn observe_outcome(outcome: &RequestOutcome) {
    let result = if outcome.is_success() { "success" } else { "failure" };
    REQUESTS_TOTAL
        .with_label_values(&[&outcome.tag, result])
        .inc();
    REQUEST_DURATION
        .with_label_values(&[&outcome.tag])
        .observe(outcome.duration.as_secs_f64());
}

/// Render every registered metric in Prometheus text format.
pub fn export_prometheus() -> CoreResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| CoreError::SerializationError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| CoreError::SerializationError(e.to_string()))
}
