//! Prometheus metrics.
//!
//! # Metrics Collected
//! - HTTP request counts and latency
//! - Active WebSocket connections and hub evictions
//! - Bus publishes and dead-letter writes
//! - Consumer outcomes and processing latency

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "messenger";

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests").namespace(NAMESPACE),
        &["method", "path", "status"],
    )
    .expect("Failed to create HTTP_REQUESTS_TOTAL metric")
});

pub static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
    HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
        )
        .namespace(NAMESPACE)
        .buckets(buckets),
        &["method", "path"],
    )
    .expect("Failed to create HTTP_REQUEST_DURATION_SECONDS metric")
});

/// Clients currently registered with the hub
pub static WEBSOCKET_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new(
            "websocket_connections_active",
            "Number of clients registered with the hub",
        )
        .namespace(NAMESPACE),
    )
    .expect("Failed to create WEBSOCKET_CONNECTIONS_ACTIVE metric")
});

/// Clients removed by the hub rather than by their own close
pub static HUB_CLIENTS_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("hub_clients_dropped_total", "Clients dropped by the hub").namespace(NAMESPACE),
        &["reason"], // "slow", "inactive", "evicted"
    )
    .expect("Failed to create HUB_CLIENTS_DROPPED_TOTAL metric")
});

pub static BUS_MESSAGES_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_messages_published_total", "Publish attempts on the main topic")
            .namespace(NAMESPACE),
        &["result"], // "ok", "error"
    )
    .expect("Failed to create BUS_MESSAGES_PUBLISHED_TOTAL metric")
});

pub static BUS_DLQ_WRITES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_dlq_writes_total", "Dead-letter writes").namespace(NAMESPACE),
        &["source", "result"], // source: "producer", "consumer"
    )
    .expect("Failed to create BUS_DLQ_WRITES_TOTAL metric")
});

pub static CONSUMER_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("consumer_messages_total", "Consumed records by outcome").namespace(NAMESPACE),
        &["outcome"], // "processed", "invalid", "dead_lettered", "retried"
    )
    .expect("Failed to create CONSUMER_MESSAGES_TOTAL metric")
});

pub static CONSUMER_PROCESSING_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0];
    HistogramVec::new(
        HistogramOpts::new(
            "consumer_processing_duration_seconds",
            "Time from dispatch to commit, retries included",
        )
        .namespace(NAMESPACE)
        .buckets(buckets),
        &["outcome"],
    )
    .expect("Failed to create CONSUMER_PROCESSING_DURATION_SECONDS metric")
});

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("Failed to register HTTP_REQUESTS_TOTAL");
    registry
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");
    registry
        .register(Box::new(WEBSOCKET_CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register WEBSOCKET_CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(HUB_CLIENTS_DROPPED_TOTAL.clone()))
        .expect("Failed to register HUB_CLIENTS_DROPPED_TOTAL");
    registry
        .register(Box::new(BUS_MESSAGES_PUBLISHED_TOTAL.clone()))
        .expect("Failed to register BUS_MESSAGES_PUBLISHED_TOTAL");
    registry
        .register(Box::new(BUS_DLQ_WRITES_TOTAL.clone()))
        .expect("Failed to register BUS_DLQ_WRITES_TOTAL");
    registry
        .register(Box::new(CONSUMER_MESSAGES_TOTAL.clone()))
        .expect("Failed to register CONSUMER_MESSAGES_TOTAL");
    registry
        .register(Box::new(CONSUMER_PROCESSING_DURATION_SECONDS.clone()))
        .expect("Failed to register CONSUMER_PROCESSING_DURATION_SECONDS");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration_secs);
}

pub fn set_websocket_connections(count: usize) {
    WEBSOCKET_CONNECTIONS_ACTIVE.set(count as i64);
}

pub fn record_client_dropped(reason: &str) {
    HUB_CLIENTS_DROPPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_publish(ok: bool) {
    BUS_MESSAGES_PUBLISHED_TOTAL
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .inc();
}

pub fn record_dlq_write(source: &str, ok: bool) {
    BUS_DLQ_WRITES_TOTAL
        .with_label_values(&[source, if ok { "ok" } else { "error" }])
        .inc();
}

pub fn record_consumer_outcome(outcome: &str) {
    CONSUMER_MESSAGES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_processing(outcome: &str, duration_secs: f64) {
    CONSUMER_PROCESSING_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}
