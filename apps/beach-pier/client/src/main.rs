use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use beach_pier_client::{Control, StdoutSink, Viewer, ViewerConfig};
use beach_pier_core::logging::{self, LogConfig, LogLevel};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier-view",
    author,
    version,
    about = "Watch a shared beach-pier terminal"
)]
struct Cli {
    /// WebSocket endpoint, e.g. ws://127.0.0.1:7681/ws
    url: String,

    /// Live output kept while waiting for a snapshot.
    #[arg(long, env = "BEACH_PIER_VIEW_BUFFER_BYTES", default_value_t = ViewerConfig::DEFAULT_BUFFER_BYTES)]
    buffer_bytes: usize,

    /// How long to wait for a snapshot before asking again.
    #[arg(long, env = "BEACH_PIER_VIEW_RESYNC_TIMEOUT_MS", default_value_t = 5000)]
    resync_timeout_ms: u64,

    #[arg(long, env = "BEACH_PIER_LOG_LEVEL", value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, env = "BEACH_PIER_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let mut config = ViewerConfig::new(cli.url);
    config.buffer_bytes = cli.buffer_bytes;
    config.resync_timeout = Duration::from_millis(cli.resync_timeout_ms);
    info!(url = %config.url, buffer_bytes = config.buffer_bytes, "starting beach-pier-view");

    let (control, control_rx) = mpsc::unbounded_channel();
    let signals = tokio::spawn(forward_signals(control));

    let result = Viewer::new(config, StdoutSink::new())
        .run(control_rx)
        .await
        .map(|_| ())
        .context("viewer failed");
    signals.abort();
    result
}

/// `SIGCONT` means the terminal is visible again, `SIGUSR1` asks for a
/// manual resync, Ctrl-C shuts down.
#[cfg(unix)]
async fn forward_signals(control: mpsc::UnboundedSender<Control>) -> Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut resumed = unix_signal(SignalKind::from_raw(libc::SIGCONT))
        .context("failed to install SIGCONT handler")?;
    let mut manual =
        unix_signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    loop {
        let command = tokio::select! {
            _ = resumed.recv() => Control::Visibility,
            _ = manual.recv() => Control::Manual,
            _ = signal::ctrl_c() => Control::Shutdown,
        };
        debug!(?command, "signal received");
        if control.send(command).is_err() || command == Control::Shutdown {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn forward_signals(control: mpsc::UnboundedSender<Control>) -> Result<()> {
    let _ = signal::ctrl_c().await;
    let _ = control.send(Control::Shutdown);
    Ok(())
}
