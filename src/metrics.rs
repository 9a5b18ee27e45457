//! Metrics collection and export.
//!
//! Counters and histograms ride the `metrics` crate; `GET /metrics` renders
//! the Prometheus exposition format.

use metrics::{counter, histogram, Counter, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tracing::error;

/// Global metrics registry.
pub static METRICS: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

static PROMETHEUS: Lazy<Option<PrometheusHandle>> = Lazy::new(|| {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(error = %e, "Failed to install Prometheus recorder; /metrics will be empty");
            None
        }
    }
});

pub struct MetricsRegistry {
    // Request pipeline
    pub requests_total: Counter,
    pub request_duration: Histogram,
    pub queue_wait: Histogram,
    pub queue_drains_total: Counter,

    // Key pool
    pub key_lockouts_total: Counter,
    pub key_revocations_total: Counter,
    pub upstream_retries_total: Counter,
}

impl MetricsRegistry {
    fn new() -> Self {
        Self {
            requests_total: counter!("llm_key_proxy_requests_total"),
            request_duration: histogram!("llm_key_proxy_request_duration_seconds"),
            queue_wait: histogram!("llm_key_proxy_queue_wait_seconds"),
            queue_drains_total: counter!("llm_key_proxy_queue_drains_total"),
            key_lockouts_total: counter!("llm_key_proxy_key_lockouts_total"),
            key_revocations_total: counter!("llm_key_proxy_key_revocations_total"),
            upstream_retries_total: counter!("llm_key_proxy_upstream_retries_total"),
        }
    }
}

/// Install the Prometheus recorder before any counter handle is created.
/// Called once during startup; counters created earlier would silently
/// no-op.
pub fn init() {
    Lazy::force(&PROMETHEUS);
    Lazy::force(&METRICS);
}

/// Axum handler for `GET /metrics`.
pub async fn metrics_handler() -> String {
    PROMETHEUS
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}
