//! Prometheus metrics exposition
//!
//! The session crate emits through the `metrics` facade:
//!
//! - `proxy_session_state` (gauge): label `state`, 1 for the current state
//! - `proxy_usage_remaining_bytes` / `proxy_usage_max_bytes` (gauges)
//! - `proxy_credential_fetches_total` (counter): labels `kind`, `outcome`
//!
//! The daemon adds `ipp_control_requests_total` (counter): label `action`.

use anyhow::{Context, Result};
use metrics::Unit;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run before the session manager is built so its initial state and
/// cached usage are recorded.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    describe();
    Ok(handle)
}

/// Register help text and units for every exported metric.
fn describe() {
    metrics::describe_gauge!(
        "proxy_session_state",
        "Current proxy session state, 1 for the active label"
    );
    metrics::describe_gauge!(
        "proxy_usage_remaining_bytes",
        Unit::Bytes,
        "Bytes left in the current quota period"
    );
    metrics::describe_gauge!(
        "proxy_usage_max_bytes",
        Unit::Bytes,
        "Quota size for the current period"
    );
    metrics::describe_counter!(
        "proxy_credential_fetches_total",
        "Credential service calls by reason and outcome"
    );
    metrics::describe_counter!(
        "ipp_control_requests_total",
        "Session control requests by action"
    );
}

/// Record a control API call.
pub fn record_control_action(action: &'static str) {
    metrics::counter!("ipp_control_requests_total", "action" => action).increment(1);
}
