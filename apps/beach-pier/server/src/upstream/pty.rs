use std::io::Read;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use beach_pier_core::ExitReport;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, warn};

use super::{Command, EventSink, Geometry, ProcessHandle, ProcessSpawner};
use crate::error::SpawnError;

const READ_CHUNK: usize = 4096;
/// How long the exit report waits for the reader to hit EOF, so trailing
/// output is not reported after the exit.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Spawns the upstream command on a native pseudo-terminal.
#[derive(Clone, Copy, Debug, Default)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(
        &self,
        command: &Command,
        geometry: Geometry,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let pair = native_pty_system()
            .openpty(pty_size(geometry))
            .map_err(|err| SpawnError::Pty(err.to_string()))?;

        let mut builder = CommandBuilder::new(&command.program);
        for arg in &command.args {
            builder.arg(arg);
        }
        if let Some(cwd) = &command.cwd {
            builder.cwd(Path::new(cwd));
        }
        if std::env::var_os("TERM").is_none() {
            builder.env("TERM", "xterm-256color");
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| SpawnError::Command {
                program: command.program.clone(),
                reason: err.to_string(),
            })?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let mut killer = child.clone_killer();
        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(err) => {
                let _ = killer.kill();
                return Err(SpawnError::Pty(err.to_string()));
            }
        };

        let (drained_tx, drained_rx) = std_mpsc::channel::<()>();
        let reader_events = events.clone();
        let spawned = thread::Builder::new()
            .name("pier-pty-reader".into())
            .spawn(move || {
                read_output(reader, &reader_events);
                let _ = drained_tx.send(());
            })
            .and_then(|_| {
                thread::Builder::new()
                    .name("pier-pty-wait".into())
                    .spawn(move || {
                        let report = match child.wait() {
                            Ok(status) => {
                                let signal = status.signal().map(str::to_string);
                                match signal {
                                    Some(signal) => ExitReport::signal(signal),
                                    None => ExitReport::code(status.exit_code() as i32),
                                }
                            }
                            Err(err) => {
                                warn!(target: "pier::supervisor", error = %err, "failed to wait for upstream process");
                                ExitReport::default()
                            }
                        };
                        let _ = drained_rx.recv_timeout(OUTPUT_DRAIN_GRACE);
                        events.exited(report);
                    })
            });
        if let Err(err) = spawned {
            let _ = killer.kill();
            return Err(SpawnError::Io(err));
        }

        Ok(Box::new(PtyProcess {
            master: Mutex::new(pair.master),
            killer,
        }))
    }
}

struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl ProcessHandle for PtyProcess {
    fn resize(&self, geometry: Geometry) -> Result<(), SpawnError> {
        self.master
            .lock()
            .resize(pty_size(geometry))
            .map_err(|err| SpawnError::Pty(err.to_string()))
    }

    fn kill(&mut self) -> Result<(), SpawnError> {
        self.killer.kill().map_err(SpawnError::Io)
    }
}

fn read_output(mut reader: Box<dyn Read + Send>, events: &EventSink) {
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if !events.output(buffer[..n].to_vec()) {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the child side closes.
            Err(err) => {
                debug!(target: "pier::supervisor", error = %err, "pty reader stopped");
                break;
            }
        }
    }
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
