//! Prometheus metrics
//!
//! Counters for the auth, write, read and ingest paths.

use lazy_static::lazy_static;
use prometheus::{self, Counter, CounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref OAUTH_LOGINS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("appview_oauth_logins_total", "Total OAuth login attempts"),
        &["status"]
    ).unwrap();

    pub static ref TOKEN_REFRESHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("appview_token_refreshes_total", "Total token refresh attempts"),
        &["status"]
    ).unwrap();

    pub static ref WRITES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("appview_writes_total", "Completed coordinated writes"),
        &["operation"]
    ).unwrap();

    pub static ref COMPENSATIONS_TOTAL: Counter = Counter::new(
        "appview_compensations_total",
        "Writes that required compensation"
    ).unwrap();

    pub static ref LANDING_READS_TOTAL: Counter = Counter::new(
        "appview_landing_reads_total",
        "Assembled repo landing views"
    ).unwrap();

    pub static ref INGEST_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("appview_ingest_events_total", "Events applied to the index"),
        &["kind", "status"]
    ).unwrap();

    pub static ref INGEST_CONNECTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("appview_ingest_connects_total", "Event feed connections established"),
        &["host"]
    ).unwrap();
}

/// Register all metrics with the registry
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(OAUTH_LOGINS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(TOKEN_REFRESHES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(WRITES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(COMPENSATIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LANDING_READS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_EVENTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_CONNECTS_TOTAL.clone()))
        .unwrap();
}

/// Handler for the /metrics endpoint - Prometheus text format
pub async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

pub fn record_oauth_login(success: bool) {
    let status = if success { "success" } else { "failure" };
    OAUTH_LOGINS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_token_refresh(success: bool) {
    let status = if success { "success" } else { "failure" };
    TOKEN_REFRESHES_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_write(operation: &str) {
    WRITES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_compensation() {
    COMPENSATIONS_TOTAL.inc();
}

pub fn record_landing_read() {
    LANDING_READS_TOTAL.inc();
}

pub fn record_ingest_event(kind: &str, success: bool) {
    let status = if success { "applied" } else { "dead_letter" };
    INGEST_EVENTS_TOTAL.with_label_values(&[kind, status]).inc();
}

pub fn record_ingest_connect(host: &str) {
    INGEST_CONNECTS_TOTAL.with_label_values(&[host]).inc();
}
