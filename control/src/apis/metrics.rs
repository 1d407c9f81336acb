//! Controller metrics
//!
//! Reconciliation, queue and snapshot metrics in their own registry; the
//! proxy registry lives in `proxy::metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconciliation duration
    #[allow(clippy::expect_used)]
    static ref RECONCILE_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "portico_reconcile_duration_seconds",
            "Ingress reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["result"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Reconciliations total
    #[allow(clippy::expect_used)]
    static ref RECONCILE_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "portico_reconciliations_total",
            "Total number of ingress reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Watch notifications by kind
    #[allow(clippy::expect_used)]
    static ref WATCH_EVENTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "portico_watch_events_total",
            "Routing resource notifications received from the watch",
        );
        let counter = IntCounterVec::new(opts, &["kind"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys re-queued after a failed reconciliation
    #[allow(clippy::expect_used)]
    static ref QUEUE_RETRIES_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "portico_queue_retries_total",
            "Keys re-queued with backoff after a failure",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys dropped after exhausting retries
    #[allow(clippy::expect_used)]
    static ref QUEUE_DROPS_TOTAL: IntCounter = {
        let counter = IntCounter::new(
            "portico_queue_drops_total",
            "Keys dropped after the maximum number of failed attempts",
        )
        .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Keys ready to be processed
    #[allow(clippy::expect_used)]
    static ref QUEUE_DEPTH: IntGauge = {
        let gauge = IntGauge::new("portico_queue_depth", "Keys waiting for a worker")
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Routes in the published snapshot
    #[allow(clippy::expect_used)]
    static ref SNAPSHOT_ROUTES: IntGauge = {
        let gauge = IntGauge::new(
            "portico_routing_table_routes",
            "Routes in the published routing table",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Certificates in the published snapshot
    #[allow(clippy::expect_used)]
    static ref SNAPSHOT_CERTIFICATES: IntGauge = {
        let gauge = IntGauge::new(
            "portico_routing_table_certificates",
            "SNI certificates in the published routing table",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };
}

/// Record one reconciliation
pub fn record_reconciliation(duration_secs: f64, result: &str) {
    RECONCILE_DURATION
        .with_label_values(&[result])
        .observe(duration_secs);
    RECONCILE_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_watch_event(kind: &str) {
    WATCH_EVENTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_queue_retry() {
    QUEUE_RETRIES_TOTAL.inc();
}

pub fn record_queue_drop() {
    QUEUE_DROPS_TOTAL.inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

/// Record the size of a newly published snapshot
pub fn record_snapshot(routes: usize, certificates: usize) {
    SNAPSHOT_ROUTES.set(routes as i64);
    SNAPSHOT_CERTIFICATES.set(certificates as i64);
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}
