//! HTTP Proxy Metrics
//!
//! Prometheus metrics for the listeners and the forwarding path.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global metrics registry for proxy metrics
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    /// HTTP request duration histogram (in seconds)
    ///
    /// Note: Fallback metrics use .expect() as last line of defense - if Prometheus itself is broken, we should panic
    #[allow(clippy::expect_used)]
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "portico_http_request_duration_seconds",
            "HTTP request latencies in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.010, 0.025, 0.050, 0.075, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
        ]);
        let histogram = HistogramVec::new(opts, &["listener", "status"])
            .unwrap_or_else(|e| {
                eprintln!("WARN: Failed to create portico_http_request_duration_seconds histogram: {}", e);
                HistogramVec::new(
                    HistogramOpts::new("portico_http_request_duration_seconds_fallback", "Fallback metric for HTTP request duration"),
                    &["listener", "status"]
                ).expect("Fallback metric creation should never fail - if this panics, Prometheus is broken")
            });
        if let Err(e) = METRICS_REGISTRY.register(Box::new(histogram.clone())) {
            eprintln!("WARN: Failed to register portico_http_request_duration_seconds histogram: {}", e);
            eprintln!("WARN: Metrics collection will be degraded but the proxy will continue");
        }
        histogram
    };

    /// HTTP requests by listener and response status
    #[allow(clippy::expect_used)]
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = {
        let opts = Opts::new("portico_http_requests_total", "Total number of HTTP requests");
        let counter = IntCounterVec::new(opts, &["listener", "status"])
            .unwrap_or_else(|e| {
                eprintln!("WARN: Failed to create portico_http_requests_total counter: {}", e);
                IntCounterVec::new(
                    Opts::new("portico_http_requests_total_fallback", "Fallback metric for HTTP requests total"),
                    &["listener", "status"]
                ).expect("Fallback metric creation should never fail - if this panics, Prometheus is broken")
            });
        if let Err(e) = METRICS_REGISTRY.register(Box::new(counter.clone())) {
            eprintln!("WARN: Failed to register portico_http_requests_total counter: {}", e);
            eprintln!("WARN: Metrics collection will be degraded but the proxy will continue");
        }
        counter
    };

    /// Handshakes rejected by certificate selection
    #[allow(clippy::expect_used)]
    pub static ref TLS_HANDSHAKE_FAILURES: IntCounterVec = {
        let opts = Opts::new(
            "portico_tls_handshake_failures_total",
            "TLS handshakes rejected during certificate selection",
        );
        let counter = IntCounterVec::new(opts, &["reason"])
            .unwrap_or_else(|e| {
                eprintln!("WARN: Failed to create portico_tls_handshake_failures_total counter: {}", e);
                IntCounterVec::new(
                    Opts::new("portico_tls_handshake_failures_total_fallback", "Fallback metric for TLS handshake failures"),
                    &["reason"]
                ).expect("Fallback metric creation should never fail - if this panics, Prometheus is broken")
            });
        if let Err(e) = METRICS_REGISTRY.register(Box::new(counter.clone())) {
            eprintln!("WARN: Failed to register portico_tls_handshake_failures_total counter: {}", e);
        }
        counter
    };
}

/// Convert status code to static string (zero allocations for common codes)
pub fn status_to_str(status: u16) -> &'static str {
    match status {
        200 => "200",
        201 => "201",
        204 => "204",
        301 => "301",
        302 => "302",
        304 => "304",
        308 => "308",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => "other",
    }
}

/// Record a completed request on `listener` ("http" or "https")
pub fn record_request(listener: &str, status: u16, duration_secs: f64) {
    let status = status_to_str(status);
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[listener, status])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[listener, status])
        .observe(duration_secs);
}

pub fn record_tls_handshake_failure(reason: &str) {
    TLS_HANDSHAKE_FAILURES.with_label_values(&[reason]).inc();
}

/// Encode proxy and controller metrics in Prometheus text format
pub fn encode_metrics() -> Result<Vec<u8>, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();

    let mut metric_families = METRICS_REGISTRY.gather();
    metric_families.extend(crate::apis::metrics::CONTROLLER_METRICS_REGISTRY.gather());
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    Ok(buffer)
}

/// Get the Prometheus text encoder format type
pub fn metrics_content_type() -> &'static str {
    "text/plain; version=0.0.4; charset=utf-8"
}
