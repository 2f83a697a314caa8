//! Prometheus metrics setup and descriptions.
//!
//! Operational metrics are recorded throughout the codebase with the
//! `metrics` crate's macros; this module installs the exporter and registers
//! descriptions. Token-usage metrics are a separate concern, served by
//! [`crate::metrics_monitor`].

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works
/// — the macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!(
        "llmsnap_requests_total",
        "Requests proxied to backends, per model"
    );
    describe_gauge!(
        "llmsnap_in_flight",
        "Requests currently streaming through a backend, per model"
    );
}
