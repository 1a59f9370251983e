use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::LazyLock;

/// Total number of requests accepted on the proxy port.
pub static PROXY_REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("proxy_requests_total", "Total number of accepted proxy requests")
        .unwrap()
});

/// Requests successfully relayed, per backend.
pub static PROXY_REQUESTS_FORWARDED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_requests_forwarded_total",
        "Requests successfully forwarded per backend",
        &["backend"]
    )
    .unwrap()
});

/// Requests that failed in transit to a backend, per backend.
///
/// Each of these also marks the backend dead until the next successful probe.
pub static PROXY_REQUESTS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_requests_failed_total",
        "Requests that failed against a backend",
        &["backend"]
    )
    .unwrap()
});

/// Requests answered 503 because no healthy backend appeared within the wait
/// bound. A nonzero rate here means the whole pool was dark.
pub static NO_BACKEND_AVAILABLE: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "no_backend_available_total",
        "Requests rejected because no healthy backend was available"
    )
    .unwrap()
});

/// Total number of configured backends, set once at startup.
pub static TOTAL_BACKENDS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("total_backends", "Number of configured backends").unwrap()
});

/// Backends currently classified alive; refreshed after every health cycle.
pub static HEALTHY_BACKENDS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("healthy_backends", "Number of currently healthy backends").unwrap()
});

/// Failed health probes, per backend.
pub static HEALTHCHECK_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "healthcheck_failed_total",
        "Failed health probes per backend",
        &["backend"]
    )
    .unwrap()
});

/// Health-probe round-trip latency per backend, in seconds.
pub static HEALTH_CHECK_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "health_check_duration_seconds",
        "Health probe latency per backend",
        &["backend"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]
    )
    .unwrap()
});
