//! Prometheus export for the realtime client metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder and describe the client metrics.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or a recorder is
/// already installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    nimbus_realtime::metrics::describe();

    info!("Metrics server listening on {}", addr);
    Ok(())
}
