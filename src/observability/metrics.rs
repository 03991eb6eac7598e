//! Prometheus metrics.

use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// `[metrics]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are recorded.
    pub enabled: bool,
    /// Port of the scrape endpoint.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl MetricsConfig {
    /// Address the scrape endpoint binds to.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }
}

/// Installs the Prometheus recorder as the global `metrics` recorder.
///
/// With `expose`, the scrape endpoint is served on [`MetricsConfig::port`]
/// from a task on the current runtime. Returns `None` when metrics are
/// disabled.
///
/// # Errors
///
/// Returns an error if a recorder is already installed, or if `expose` is
/// set outside a Tokio runtime.
pub fn install_prometheus(config: &MetricsConfig, expose: bool) -> Result<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let recorder = if expose {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| install_error(&e))?;
        let (recorder, exporter) = {
            let _entered = runtime.enter();
            PrometheusBuilder::new()
                .with_http_listener(config.listen_addr())
                .build()
                .map_err(|e| install_error(&e))?
        };
        runtime.spawn(async move {
            if let Err(err) = exporter.await {
                tracing::error!(error = ?err, "Prometheus exporter stopped");
            }
        });
        recorder
    } else {
        PrometheusBuilder::new().build_recorder()
    };

    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|e| install_error(&e))?;
    tracing::info!(expose, port = config.port, "Prometheus metrics installed");
    Ok(Some(handle))
}

fn install_error(err: &dyn std::fmt::Display) -> Error {
    Error::OperationFailed {
        operation: "metrics_install".to_string(),
        cause: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_installs_nothing() {
        let handle = install_prometheus(&MetricsConfig::default(), false).unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn test_recorder_renders_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("ingest_samples_total", "outcome" => "accepted").increment(2);
        });
        let rendered = handle.render();
        assert!(rendered.contains("ingest_samples_total"));
    }
}
