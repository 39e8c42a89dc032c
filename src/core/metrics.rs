//! Prometheus metrics for monitoring the gateway.
//!
//! A single process-wide registry is created lazily; every component records
//! through [`get_metrics`].

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, provider and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Outbound provider calls by provider and outcome
    pub upstream_requests: IntCounterVec,

    /// Provider response latency histogram in seconds
    pub upstream_latency: HistogramVec,

    /// Cache hits, misses, sets, evictions, expirations and rejections
    pub cache_events: IntCounterVec,

    /// Requests rejected by admission control, by reason
    pub rate_limited: IntCounterVec,

    /// Stream terminations by outcome (completed, timeout, error, disconnect, ...)
    pub stream_outcomes: IntCounterVec,

    /// Upstream SSE lines that failed to parse
    pub stream_malformed_lines: IntCounterVec,

    /// Retry attempts beyond the first, by outcome
    pub retry_attempts: IntCounterVec,

    /// Circuit state per provider endpoint (0=closed, 1=open, 2=half-open)
    pub circuit_state: GaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Subsequent calls return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "gateway_requests_total",
            "Total number of requests",
            &["method", "endpoint", "provider", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "gateway_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint", "provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "gateway_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let upstream_requests = register_int_counter_vec!(
            "gateway_upstream_requests_total",
            "Outbound provider calls",
            &["provider", "outcome"]
        )
        .expect("Failed to register upstream_requests metric");

        let upstream_latency = register_histogram_vec!(
            "gateway_upstream_latency_seconds",
            "Provider response latency in seconds",
            &["provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register upstream_latency metric");

        let cache_events = register_int_counter_vec!(
            "gateway_cache_events_total",
            "Response cache events",
            &["event"]
        )
        .expect("Failed to register cache_events metric");

        let rate_limited = register_int_counter_vec!(
            "gateway_rate_limited_total",
            "Requests rejected by the rate limiter",
            &["reason"]
        )
        .expect("Failed to register rate_limited metric");

        let stream_outcomes = register_int_counter_vec!(
            "gateway_stream_outcomes_total",
            "Streaming response terminations",
            &["outcome"]
        )
        .expect("Failed to register stream_outcomes metric");

        let stream_malformed_lines = register_int_counter_vec!(
            "gateway_stream_malformed_lines_total",
            "Upstream stream lines that could not be parsed",
            &["provider"]
        )
        .expect("Failed to register stream_malformed_lines metric");

        let retry_attempts = register_int_counter_vec!(
            "gateway_retry_attempts_total",
            "Retry attempts after the first try",
            &["outcome"]
        )
        .expect("Failed to register retry_attempts metric");

        let circuit_state = register_gauge_vec!(
            "gateway_circuit_state",
            "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            &["circuit"]
        )
        .expect("Failed to register circuit_state metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            upstream_requests,
            upstream_latency,
            cache_events,
            rate_limited,
            stream_outcomes,
            stream_malformed_lines,
            retry_attempts,
            circuit_state,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
