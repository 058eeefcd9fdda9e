//! Metric emission for session state, usage and credential fetches
//!
//! Uses the `metrics` facade. The binary installs the Prometheus recorder;
//! without one these calls are no-ops.

use guardian::ProxyUsage;
use metrics::{counter, gauge};

use crate::events::ProxyState;

/// One gauge per state label, 1.0 for the current state and 0.0 otherwise.
pub(crate) fn record_state(current: ProxyState) {
    for state in ProxyState::ALL {
        let value = if state == current { 1.0 } else { 0.0 };
        gauge!("proxy_session_state", "state" => state.label()).set(value);
    }
}

pub(crate) fn record_usage(usage: &ProxyUsage) {
    gauge!("proxy_usage_remaining_bytes").set(usage.remaining as f64);
    gauge!("proxy_usage_max_bytes").set(usage.max as f64);
}

/// `kind` is the fetch reason label, `outcome` a pass status label or
/// `transport_error`.
pub(crate) fn record_fetch(kind: &'static str, outcome: &'static str) {
    counter!("proxy_credential_fetches_total", "kind" => kind, "outcome" => outcome).increment(1);
}
