use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use beach_pier_core::logging::{LogConfig, LogLevel};
use clap::Parser;

use crate::error::ConfigError;
use crate::fanout::FlowLimits;
use crate::service::ServiceConfig;
use crate::upstream::{Command, Geometry};

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Share one terminal process read-only with many WebSocket viewers"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:7681")]
    pub listen_addr: String,

    /// Program to run. Arguments after `--` are passed to it; without
    /// `--command` the first of them is the program.
    #[arg(long, env = "BEACH_PIER_COMMAND")]
    pub command: Option<String>,

    #[arg(last = true, value_name = "ARGS")]
    pub args: Vec<String>,

    /// Working directory for the process.
    #[arg(long, env = "BEACH_PIER_CWD")]
    pub cwd: Option<PathBuf>,

    /// Delay before restarting an exited process.
    #[arg(long, env = "BEACH_PIER_RESTART_DELAY_MS", default_value_t = 1000)]
    pub restart_delay_ms: u64,

    #[arg(long, env = "BEACH_PIER_COLS", default_value_t = 120)]
    pub cols: u16,

    #[arg(long, env = "BEACH_PIER_ROWS", default_value_t = 40)]
    pub rows: u16,

    /// Scrollback lines kept by the mirrored screen. Derived from
    /// `--history-bytes` when unset.
    #[arg(long, env = "BEACH_PIER_SCROLLBACK")]
    pub scrollback: Option<usize>,

    #[arg(long, env = "BEACH_PIER_HISTORY_BYTES", default_value_t = 1_048_576)]
    pub history_bytes: usize,

    /// Period of the full-screen refresh pushed to every viewer. `0` disables it.
    #[arg(long, env = "BEACH_PIER_SNAPSHOT_INTERVAL_MS", default_value_t = 30_000)]
    pub snapshot_interval_ms: u64,

    /// Per-viewer backlog at which live delivery is deferred.
    #[arg(long, env = "BEACH_PIER_HIGH_WATER_BYTES", default_value_t = 1_048_576)]
    pub high_water_bytes: usize,

    #[arg(long, env = "BEACH_PIER_LOG_LEVEL", value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    #[arg(long, env = "BEACH_PIER_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub command: Command,
    pub geometry: Geometry,
    pub scrollback: usize,
    pub restart_delay: Duration,
    pub snapshot_interval: Duration,
    pub flow: FlowLimits,
    pub log: LogConfig,
}

impl ServerConfig {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            command: Some(self.command.clone()),
            geometry: self.geometry,
            restart_delay: self.restart_delay,
            snapshot_interval: self.snapshot_interval,
            flow: self.flow,
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = match cli.listen_addr.parse() {
            Ok(addr) => addr,
            Err(err) => {
                return Err(ConfigError::ListenAddr {
                    value: cli.listen_addr,
                    reason: format!("{err}"),
                })
            }
        };

        let mut args = cli.args.into_iter();
        let program = match cli.command {
            Some(program) => program,
            None => args.next().unwrap_or_default(),
        };
        if program.trim().is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        let mut command = Command::new(program).args(args);
        if let Some(cwd) = cli.cwd {
            command = command.cwd(cwd);
        }

        if cli.cols == 0 || cli.rows == 0 {
            return Err(ConfigError::Geometry {
                cols: cli.cols,
                rows: cli.rows,
            });
        }
        if cli.high_water_bytes == 0 {
            return Err(ConfigError::HighWater);
        }

        let scrollback = cli
            .scrollback
            .unwrap_or(cli.history_bytes / usize::from(cli.cols));

        Ok(ServerConfig {
            listen_addr,
            command,
            geometry: Geometry::new(cli.cols, cli.rows),
            scrollback,
            restart_delay: Duration::from_millis(cli.restart_delay_ms),
            snapshot_interval: Duration::from_millis(cli.snapshot_interval_ms),
            flow: FlowLimits::new(cli.high_water_bytes),
            log: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig, ConfigError> {
        let cli = Cli::try_parse_from(std::iter::once("beach-pier").chain(args.iter().copied()))
            .expect("arguments should parse");
        ServerConfig::try_from(cli)
    }

    #[test_timeout::timeout]
    fn defaults_derive_scrollback_and_low_water() {
        let config = parse(&["--command", "bash"]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7681".parse().unwrap());
        assert_eq!(config.command, Command::new("bash"));
        assert_eq!(config.geometry, Geometry::new(120, 40));
        assert_eq!(config.scrollback, 1_048_576 / 120);
        assert_eq!(config.restart_delay, Duration::from_secs(1));
        assert_eq!(config.snapshot_interval, Duration::from_secs(30));
        assert_eq!(config.flow.high_water, 1_048_576);
        assert_eq!(config.flow.low_water, 524_288);
        assert_eq!(config.log.level, LogLevel::Warn);
    }

    #[test_timeout::timeout]
    fn trailing_args_supply_program_when_command_is_absent() {
        let config = parse(&["--cwd", "/tmp", "--", "htop", "-d", "10"]).unwrap();
        assert_eq!(
            config.command,
            Command::new("htop").args(["-d", "10"]).cwd("/tmp")
        );

        let config = parse(&["--command", "tail", "--", "-f", "log.txt"]).unwrap();
        assert_eq!(config.command, Command::new("tail").args(["-f", "log.txt"]));
    }

    #[test_timeout::timeout]
    fn blank_or_missing_command_is_rejected() {
        assert_eq!(parse(&[]).unwrap_err(), ConfigError::MissingCommand);
        assert_eq!(
            parse(&["--command", "  "]).unwrap_err(),
            ConfigError::MissingCommand
        );
    }

    #[test_timeout::timeout]
    fn invalid_values_are_rejected() {
        assert_eq!(
            parse(&["--command", "sh", "--cols", "0"]).unwrap_err(),
            ConfigError::Geometry { cols: 0, rows: 40 }
        );
        assert_eq!(
            parse(&["--command", "sh", "--high-water-bytes", "0"]).unwrap_err(),
            ConfigError::HighWater
        );
        assert!(matches!(
            parse(&["--command", "sh", "--listen-addr", "nowhere"]),
            Err(ConfigError::ListenAddr { .. })
        ));
    }

    #[test_timeout::timeout]
    fn small_high_water_caps_low_water() {
        let config = parse(&["--command", "sh", "--high-water-bytes", "4096"]).unwrap();
        assert_eq!(config.flow.high_water, 4096);
        assert_eq!(config.flow.low_water, 4096);
    }
}
