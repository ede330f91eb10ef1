//! Telemetry initializers.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Initialize the tracing subscriber, honoring environment filters when provided.
pub(crate) fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Install the Prometheus recorder and serve it on `address`.
///
/// Forwarding keeps working without metrics, so a failed install is only logged.
pub(crate) fn init_metrics(address: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(address).install() {
        Ok(()) => info!("serving metrics on http://{address}/metrics"),
        Err(error) => warn!(%error, "failed to install metrics exporter"),
    }
}
