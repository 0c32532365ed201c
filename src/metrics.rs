//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "chanfed_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref INBOX_ACTIVITIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chanfed_inbox_activities_total", "Inbound activities by type and outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chanfed_delivery_attempts_total", "Outbound delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_IN_FLIGHT: IntGauge = IntGauge::new(
        "chanfed_deliveries_in_flight",
        "Delivery tasks currently running"
    ).expect("metric can be created");
    pub static ref CACHE_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chanfed_cache_writes_total", "Remote object cache writes by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref ACTOR_RESOLUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chanfed_actor_resolutions_total", "Actor resolutions by source"),
        &["source"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chanfed_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Later calls are no-ops.
pub fn init_metrics() {
    INIT.call_once(register_all);
}

fn register_all() {
    REGISTRY
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("HTTP_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(INBOX_ACTIVITIES_TOTAL.clone()))
        .expect("INBOX_ACTIVITIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_IN_FLIGHT.clone()))
        .expect("DELIVERIES_IN_FLIGHT can be registered");
    REGISTRY
        .register(Box::new(CACHE_WRITES_TOTAL.clone()))
        .expect("CACHE_WRITES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTOR_RESOLUTIONS_TOTAL.clone()))
        .expect("ACTOR_RESOLUTIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
