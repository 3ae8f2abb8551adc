use std::sync::Arc;

use beach_pier_core::ExitReport;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Command, EventSink, Geometry, ProcessHandle, ProcessSpawner};
use crate::error::SpawnError;

#[derive(Default)]
struct FakeState {
    spawns: Vec<(Command, Geometry)>,
    current: Option<EventSink>,
    failures: usize,
    kills: usize,
    resizes: Vec<Geometry>,
}

/// Scriptable upstream for tests. Clones share state: hand one to the
/// service and drive the process through another.
#[derive(Clone)]
pub struct FakeSpawner {
    state: Arc<Mutex<FakeState>>,
    spawned: Arc<watch::Sender<usize>>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            spawned: Arc::new(watch::channel(0).0),
        }
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_count(&self) -> usize {
        *self.spawned.borrow()
    }

    pub fn spawns(&self) -> Vec<(Command, Geometry)> {
        self.state.lock().spawns.clone()
    }

    pub fn kill_count(&self) -> usize {
        self.state.lock().kills
    }

    pub fn resizes(&self) -> Vec<Geometry> {
        self.state.lock().resizes.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// The next `count` spawn attempts fail.
    pub fn fail_next_spawns(&self, count: usize) {
        self.state.lock().failures = count;
    }

    /// Emits output from the live process. Returns `false` if none is running.
    pub fn emit(&self, bytes: &[u8]) -> bool {
        let state = self.state.lock();
        match &state.current {
            Some(sink) => sink.output(bytes.to_vec()),
            None => false,
        }
    }

    /// Ends the live process with the given report.
    pub fn exit(&self, report: ExitReport) -> bool {
        let current = self.state.lock().current.take();
        match current {
            Some(sink) => sink.exited(report),
            None => false,
        }
    }

    /// Resolves once at least `count` spawn attempts have succeeded.
    pub async fn wait_for_spawns(&self, count: usize) {
        let mut rx = self.spawned.subscribe();
        let _ = rx.wait_for(|spawned| *spawned >= count).await;
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(
        &self,
        command: &Command,
        geometry: Geometry,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        {
            let mut state = self.state.lock();
            if state.failures > 0 {
                state.failures -= 1;
                return Err(SpawnError::Command {
                    program: command.program.clone(),
                    reason: "injected spawn failure".into(),
                });
            }
            state.spawns.push((command.clone(), geometry));
            state.current = Some(events.clone());
        }
        self.spawned.send_modify(|count| *count += 1);
        Ok(Box::new(FakeProcess {
            instance: events.instance(),
            state: self.state.clone(),
        }))
    }
}

struct FakeProcess {
    instance: u64,
    state: Arc<Mutex<FakeState>>,
}

impl ProcessHandle for FakeProcess {
    fn resize(&self, geometry: Geometry) -> Result<(), SpawnError> {
        self.state.lock().resizes.push(geometry);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), SpawnError> {
        let mut state = self.state.lock();
        state.kills += 1;
        let owned = state
            .current
            .as_ref()
            .is_some_and(|sink| sink.instance() == self.instance);
        if owned {
            if let Some(sink) = state.current.take() {
                sink.exited(ExitReport::signal("SIGKILL"));
            }
        }
        Ok(())
    }
}
