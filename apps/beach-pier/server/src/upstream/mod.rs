//! The upstream process collaborator: something that spawns one process with
//! a fixed geometry, reports its output and exit, and can be killed.

#[cfg(any(test, feature = "test-support"))]
mod fake;
mod pty;
mod utf8;

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeSpawner;
pub use pty::PtySpawner;
pub use utf8::Utf8Stream;

use std::path::PathBuf;

use beach_pier_core::ExitReport;
use tokio::sync::mpsc;

use crate::error::SpawnError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Output(Vec<u8>),
    Exited(ExitReport),
}

/// Instance-tagged sender handed to each spawned process. The supervisor
/// ignores events from instances it has already replaced.
#[derive(Clone, Debug)]
pub struct EventSink {
    instance: u64,
    tx: mpsc::UnboundedSender<(u64, UpstreamEvent)>,
}

impl EventSink {
    pub fn new(instance: u64, tx: mpsc::UnboundedSender<(u64, UpstreamEvent)>) -> Self {
        Self { instance, tx }
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn output(&self, bytes: Vec<u8>) -> bool {
        self.tx
            .send((self.instance, UpstreamEvent::Output(bytes)))
            .is_ok()
    }

    pub fn exited(&self, report: ExitReport) -> bool {
        self.tx
            .send((self.instance, UpstreamEvent::Exited(report)))
            .is_ok()
    }
}

pub trait ProcessSpawner: Send + Sync + 'static {
    fn spawn(
        &self,
        command: &Command,
        geometry: Geometry,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}

pub trait ProcessHandle: Send {
    fn resize(&self, geometry: Geometry) -> Result<(), SpawnError>;

    /// Signals termination. The exit itself arrives later as an event.
    fn kill(&mut self) -> Result<(), SpawnError>;
}
