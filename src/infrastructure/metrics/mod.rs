//! Prometheus Metrics Module
//!
//! Application-wide metrics collection for the session/presence core.
//!
//! # Metrics Collected
//! - Live gateway connection gauge
//! - Refresh outcomes by result kind
//! - Automatic mutes issued by the abuse engine

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Live gateway connections
pub static GATEWAY_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("gateway_connections", "Number of live gateway connections")
            .namespace("chat_core"),
    )
    .expect("Failed to create GATEWAY_CONNECTIONS metric")
});

/// Refresh outcomes by result kind ("rotated", "stale_refresh", "refresh_token_reuse", ...)
pub static REFRESH_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("refresh_outcomes_total", "Refresh-token rotation outcomes")
            .namespace("chat_core"),
        &["kind"],
    )
    .expect("Failed to create REFRESH_OUTCOMES_TOTAL metric")
});

/// Automatic mutes issued by the abuse engine
pub static AUTO_MUTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("auto_mutes_total", "Automatic mutes issued by the abuse engine")
            .namespace("chat_core"),
    )
    .expect("Failed to create AUTO_MUTES_TOTAL metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(GATEWAY_CONNECTIONS.clone()))
        .expect("Failed to register GATEWAY_CONNECTIONS");
    registry
        .register(Box::new(REFRESH_OUTCOMES_TOTAL.clone()))
        .expect("Failed to register REFRESH_OUTCOMES_TOTAL");
    registry
        .register(Box::new(AUTO_MUTES_TOTAL.clone()))
        .expect("Failed to register AUTO_MUTES_TOTAL");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Metrics should be valid UTF-8")
}

/// Record one refresh outcome.
pub fn record_refresh_outcome(kind: &str) {
    REFRESH_OUTCOMES_TOTAL.with_label_values(&[kind]).inc();
}
