//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Report execution metrics
    pub static ref REPORT_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_report_attempts_total", "Total number of report attempts"),
        &["action", "outcome"]
    ).expect("metric can be created");
    pub static ref TARGETS_COMPLETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_targets_completed_total", "Total number of targets reaching a terminal state"),
        &["status"]
    ).expect("metric can be created");

    // Auto-reply metrics
    pub static ref AUTOREPLY_CYCLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_autoreply_cycles_total", "Total number of auto-reply poll cycles"),
        &["trigger"]
    ).expect("metric can be created");
    pub static ref AUTOREPLY_REPLIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_autoreply_replies_total", "Total number of auto-replies sent"),
        &["outcome"]
    ).expect("metric can be created");

    // Platform client metrics
    pub static ref PLATFORM_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_platform_requests_total", "Total number of signed platform requests"),
        &["endpoint", "status"]
    ).expect("metric can be created");
    pub static ref PLATFORM_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "modpatrol_platform_request_duration_seconds",
            "Signed platform request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["endpoint"]
    ).expect("metric can be created");
    pub static ref SIGNING_KEY_REFRESHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_signing_key_refreshes_total", "Total number of signing key refreshes"),
        &["status"]
    ).expect("metric can be created");

    // Account pool metrics
    pub static ref ACCOUNTS_DEMOTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_accounts_demoted_total", "Total number of accounts demoted to invalid"),
        &["reason"]
    ).expect("metric can be created");
    pub static ref ACCOUNTS_ACTIVE: IntGauge = IntGauge::new(
        "modpatrol_accounts_active",
        "Active accounts observed at the last pool read"
    ).expect("metric can be created");

    // Error metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("modpatrol_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
///
/// Must be called once at startup before the first scrape.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(REPORT_ATTEMPTS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(TARGETS_COMPLETED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(AUTOREPLY_CYCLES_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(AUTOREPLY_REPLIES_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(PLATFORM_REQUESTS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(PLATFORM_REQUEST_DURATION_SECONDS.clone()))
        .ok();
    REGISTRY
        .register(Box::new(SIGNING_KEY_REFRESHES_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(ACCOUNTS_DEMOTED_TOTAL.clone()))
        .ok();
    REGISTRY.register(Box::new(ACCOUNTS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(ERRORS_TOTAL.clone())).ok();
}

/// Render the registry in Prometheus text exposition format.
pub fn render() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(%error, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();

        REPORT_ATTEMPTS_TOTAL
            .with_label_values(&["video", "success"])
            .inc();
        assert!(render().contains("modpatrol_report_attempts_total"));
    }
}
