use std::io;

use thiserror::Error;

/// Failures raised by a screen model implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScreenError {
    #[error("screen model has been disposed")]
    Disposed,
    #[error("screen model failure: {0}")]
    Failed(String),
}

/// Failures observed by callers of the model serializer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model serializer is closed")]
    Closed,
    #[error("model task failed: {0}")]
    Task(#[from] ScreenError),
    #[error("model task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open pty: {0}")]
    Pty(String),
    #[error("failed to spawn '{program}': {reason}")]
    Command { program: String, reason: String },
    #[error("process io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service already started")]
    AlreadyStarted,
    #[error("service not started")]
    NotStarted,
    #[error("no upstream command configured")]
    MissingCommand,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("an upstream command is required (--command or BEACH_PIER_COMMAND)")]
    MissingCommand,
    #[error("invalid listen address '{value}': {reason}")]
    ListenAddr { value: String, reason: String },
    #[error("terminal geometry must be non-zero, got {cols}x{rows}")]
    Geometry { cols: u16, rows: u16 },
    #[error("high-water mark must be greater than zero")]
    HighWater,
}
