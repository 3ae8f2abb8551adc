use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::fanout::{FanoutHub, FlowLimits, ViewerId};
use crate::resync::ResyncCoordinator;
use crate::screen::ScreenModel;
use crate::serializer::{MirroredScreen, ModelSerializer};
use crate::supervisor::{ProcessState, Supervisor, SupervisorSettings};
use crate::upstream::{Command, Geometry, ProcessSpawner};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub command: Option<Command>,
    pub geometry: Geometry,
    pub restart_delay: Duration,
    /// Zero disables the periodic refresh.
    pub snapshot_interval: Duration,
    pub flow: FlowLimits,
}

enum Lifecycle {
    Idle {
        screen: Box<dyn ScreenModel>,
        recovery: mpsc::UnboundedReceiver<ViewerId>,
    },
    Running(Running),
    Stopped,
}

struct Running {
    serializer: Arc<ModelSerializer>,
    resync: ResyncCoordinator,
    supervisor: Supervisor,
    refresher: Option<JoinHandle<()>>,
    recovery: JoinHandle<()>,
}

/// Everything one shared terminal needs: the process, its mirrored screen,
/// and the viewers watching it. Constructed idle; [`PierService::start`] and
/// [`PierService::stop`] bracket a single run.
pub struct PierService {
    config: ServiceConfig,
    spawner: Arc<dyn ProcessSpawner>,
    hub: FanoutHub,
    lifecycle: Mutex<Lifecycle>,
}

impl PierService {
    pub fn new(
        config: ServiceConfig,
        spawner: Arc<dyn ProcessSpawner>,
        screen: Box<dyn ScreenModel>,
    ) -> Self {
        let (hub, recovery) = FanoutHub::new(config.flow);
        Self {
            config,
            spawner,
            hub,
            lifecycle: Mutex::new(Lifecycle::Idle { screen, recovery }),
        }
    }

    /// Spawns the upstream process and the background tasks. Must run inside
    /// a tokio runtime. A service starts at most once.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle { .. }) {
            return Err(ServiceError::AlreadyStarted);
        }
        let command = self
            .config
            .command
            .clone()
            .filter(|command| !command.program.trim().is_empty())
            .ok_or(ServiceError::MissingCommand)?;
        let (screen, recovery) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle { screen, recovery } => (screen, recovery),
            other => {
                *lifecycle = other;
                return Err(ServiceError::AlreadyStarted);
            }
        };

        let serializer = Arc::new(ModelSerializer::spawn(MirroredScreen::new(screen)));
        let resync = ResyncCoordinator::new(self.hub.clone(), serializer.clone());
        let recovery = resync.spawn_recovery(recovery);
        let refresher = resync.spawn_refresher(self.config.snapshot_interval);
        let supervisor = Supervisor::spawn(
            SupervisorSettings {
                command: command.clone(),
                geometry: self.config.geometry,
                restart_delay: self.config.restart_delay,
            },
            self.spawner.clone(),
            serializer.clone(),
            self.hub.clone(),
            resync.clone(),
        );
        info!(
            program = %command.program,
            cols = self.config.geometry.cols,
            rows = self.config.geometry.rows,
            refresh_ms = self.config.snapshot_interval.as_millis() as u64,
            "pier service started"
        );

        *lifecycle = Lifecycle::Running(Running {
            serializer,
            resync,
            supervisor,
            refresher,
            recovery,
        });
        Ok(())
    }

    /// Tears the service down: timers, process, viewers, model queue, model.
    /// A second call is a no-op.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                Lifecycle::Stopped => return Ok(()),
                idle @ Lifecycle::Idle { .. } => {
                    *lifecycle = idle;
                    return Err(ServiceError::NotStarted);
                }
            }
        };

        if let Some(refresher) = running.refresher {
            refresher.abort();
            let _ = refresher.await;
        }
        running.recovery.abort();
        let _ = running.recovery.await;

        running.supervisor.stop().await;

        let closed = self.hub.close_all();

        match running.serializer.close().await {
            Some(screen) => screen.dispose(),
            None => warn!("screen model was not returned by the serializer"),
        }
        info!(viewers_closed = closed, "pier service stopped");
        Ok(())
    }

    pub fn hub(&self) -> &FanoutHub {
        &self.hub
    }

    pub fn resync(&self) -> Result<ResyncCoordinator, ServiceError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Ok(running.resync.clone()),
            _ => Err(ServiceError::NotStarted),
        }
    }

    pub fn process_state(&self) -> ProcessState {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running.supervisor.state(),
            _ => ProcessState::Stopped,
        }
    }

    pub fn process_states(&self) -> Result<watch::Receiver<ProcessState>, ServiceError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Ok(running.supervisor.subscribe()),
            _ => Err(ServiceError::NotStarted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::Outbound;
    use crate::screen::RecordingScreen;
    use crate::upstream::FakeSpawner;

    fn config(command: Option<Command>) -> ServiceConfig {
        ServiceConfig {
            command,
            geometry: Geometry::new(80, 24),
            restart_delay: Duration::from_millis(1000),
            snapshot_interval: Duration::from_secs(30),
            flow: FlowLimits::new(1 << 20),
        }
    }

    fn service(command: Option<Command>) -> (PierService, FakeSpawner, RecordingScreen) {
        let fake = FakeSpawner::new();
        let screen = RecordingScreen::new();
        let service = PierService::new(
            config(command),
            Arc::new(fake.clone()),
            Box::new(screen.clone()),
        );
        (service, fake, screen)
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_start_is_rejected() {
        let (service, _fake, _screen) = service(Some(Command::new("sh")));
        service.start().unwrap();
        assert!(matches!(service.start(), Err(ServiceError::AlreadyStarted)));
        service.stop().await.unwrap();
        assert!(matches!(service.start(), Err(ServiceError::AlreadyStarted)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_command_refuses_to_start() {
        let (service, fake, _screen) = service(None);
        assert!(matches!(service.start(), Err(ServiceError::MissingCommand)));
        assert_eq!(fake.spawn_count(), 0);
        assert!(matches!(service.stop().await, Err(ServiceError::NotStarted)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_kills_closes_and_disposes_in_order() {
        let (service, fake, screen) = service(Some(Command::new("sh")));
        service.start().unwrap();
        let mut states = service.process_states().unwrap();
        states
            .wait_for(|state| *state == ProcessState::Running)
            .await
            .unwrap();
        let mut inbox = service.hub().attach();

        service.stop().await.unwrap();
        assert_eq!(fake.kill_count(), 1);
        assert!(screen.is_disposed());
        assert!(service.hub().is_empty());
        assert_eq!(service.process_state(), ProcessState::Stopped);
        assert!(service.resync().is_err());

        let mut saw_close = false;
        while let Some(outbound) = inbox.try_recv() {
            saw_close = matches!(outbound, Outbound::Close);
        }
        assert!(saw_close, "close must be the last frame");

        service.stop().await.unwrap();
    }
}
