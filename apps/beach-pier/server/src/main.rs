use std::sync::Arc;

use anyhow::{Context, Result};
use beach_pier_server::routes::{self, AppState};
use beach_pier_server::screen::AlacrittyScreen;
use beach_pier_server::upstream::PtySpawner;
use beach_pier_server::{Cli, PierService, ServerConfig};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli).context("invalid configuration")?;
    let telemetry = telemetry::Telemetry::init(&config.log)?;

    info!(
        listen_addr = %config.listen_addr,
        program = %config.command.program,
        cols = config.geometry.cols,
        rows = config.geometry.rows,
        scrollback = config.scrollback,
        high_water = config.flow.high_water,
        "starting beach-pier"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let screen = AlacrittyScreen::new(
        config.geometry.cols,
        config.geometry.rows,
        config.scrollback,
    );
    let service = Arc::new(PierService::new(
        config.service_config(),
        Arc::new(PtySpawner),
        Box::new(screen),
    ));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    service.start().context("failed to start pier service")?;

    let state = Arc::new(AppState {
        service: service.clone(),
        metrics: Some(metrics),
    });
    let router = routes::router(state);

    info!("beach-pier listening on {}", config.listen_addr);

    let graceful =
        axum::serve(listener, router).with_graceful_shutdown(shutdown_signal(service.clone()));
    graceful.await.context("server shutdown with error")?;

    service.stop().await.context("failed to stop pier service")?;
    info!("shutdown complete");

    Ok(())
}

/// Resolves on Ctrl-C after stopping the service, so open viewer sockets
/// receive their close frames and graceful shutdown can finish.
async fn shutdown_signal(service: Arc<PierService>) {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
    if let Err(err) = service.stop().await {
        warn!(error = %err, "service stop failed");
    }
}
