use anyhow::{Context, Result};
use beach_pier_core::logging::{self, LogConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init(log: &LogConfig) -> Result<Self> {
        logging::init(log).context("failed to initialise logging")?;

        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        info!(
            level = log.level.as_str(),
            file = ?log.file,
            "telemetry initialised"
        );
        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}
