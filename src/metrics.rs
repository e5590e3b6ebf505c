//! Prometheus metrics for the security pipeline.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `security_rate_limited_total` - Requests rejected with 429 (label: rule)
//! - `security_csrf_failures_total` - CSRF rejections (label: reason)
//! - `security_sanitization_redirects_total` - Query strings rewritten via redirect
//! - `security_audit_events_total` - Audit records written (label: severity)
//! - `security_alert_callback_failures_total` - Alert callbacks that failed or timed out
//! - `security_store_degraded_total` - Store calls that timed out or errored (label: store)
//!
//! ## Histograms
//! - `security_pipeline_duration_seconds` - Time from receipt to response (label: outcome)
//!
//! Recording functions are no-ops until a recorder is installed, so library
//! users and tests can call them freely.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMITED_TOTAL: &str = "security_rate_limited_total";
    pub const CSRF_FAILURES_TOTAL: &str = "security_csrf_failures_total";
    pub const SANITIZATION_REDIRECTS_TOTAL: &str = "security_sanitization_redirects_total";
    pub const AUDIT_EVENTS_TOTAL: &str = "security_audit_events_total";
    pub const ALERT_CALLBACK_FAILURES_TOTAL: &str = "security_alert_callback_failures_total";
    pub const STORE_DEGRADED_TOTAL: &str = "security_store_degraded_total";
    pub const PIPELINE_DURATION_SECONDS: &str = "security_pipeline_duration_seconds";
}

/// Install the Prometheus exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected by the rate limiter"
    );
    describe_counter!(
        names::CSRF_FAILURES_TOTAL,
        "Unsafe requests rejected by CSRF verification"
    );
    describe_counter!(
        names::SANITIZATION_REDIRECTS_TOTAL,
        "Requests redirected to a sanitized query string"
    );
    describe_counter!(names::AUDIT_EVENTS_TOTAL, "Audit records written");
    describe_counter!(
        names::ALERT_CALLBACK_FAILURES_TOTAL,
        "Alert callbacks that failed, panicked or timed out"
    );
    describe_counter!(
        names::STORE_DEGRADED_TOTAL,
        "Counter or session store calls that timed out or failed"
    );
    describe_histogram!(
        names::PIPELINE_DURATION_SECONDS,
        "Security pipeline duration in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_rate_limited(rule: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "rule" => rule.to_string()).increment(1);
}

pub fn record_csrf_failure(reason: &'static str) {
    counter!(names::CSRF_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_sanitization_redirect() {
    counter!(names::SANITIZATION_REDIRECTS_TOTAL).increment(1);
}

pub fn record_audit_event(severity: &'static str) {
    counter!(names::AUDIT_EVENTS_TOTAL, "severity" => severity).increment(1);
}

pub fn record_alert_failure() {
    counter!(names::ALERT_CALLBACK_FAILURES_TOTAL).increment(1);
}

pub fn record_store_degraded(store: &'static str) {
    counter!(names::STORE_DEGRADED_TOTAL, "store" => store).increment(1);
}

pub fn record_pipeline_duration(outcome: &'static str, duration_secs: f64) {
    histogram!(names::PIPELINE_DURATION_SECONDS, "outcome" => outcome).record(duration_secs);
}
