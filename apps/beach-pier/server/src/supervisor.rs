//! Owns the one upstream process: spawn, mirror, fan out, restart.
//!
//! Runs as a single actor task. Every state change (output, exit, restart
//! timer, stop) is handled in one `select!` loop, so there is exactly one
//! restart timer and it is replaced rather than stacked.

use std::future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use beach_pier_core::{ExitReport, ProcessStatus, Seq};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Sleep};
use tracing::{debug, info, warn};

use crate::fanout::{FanoutHub, LiveChunk};
use crate::resync::ResyncCoordinator;
use crate::serializer::ModelSerializer;
use crate::upstream::{
    Command, EventSink, Geometry, ProcessHandle, ProcessSpawner, UpstreamEvent, Utf8Stream,
};

/// Upper bound on waiting for a killed process to report its exit.
const EXIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Exited,
    Stopping,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub command: Command,
    pub geometry: Geometry,
    pub restart_delay: Duration,
}

enum Control {
    Stop(oneshot::Sender<()>),
}

pub struct Supervisor {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<ProcessState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Starts the actor, which immediately launches the first process.
    pub fn spawn(
        settings: SupervisorSettings,
        spawner: Arc<dyn ProcessSpawner>,
        serializer: Arc<ModelSerializer>,
        hub: FanoutHub,
        resync: ResyncCoordinator,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ProcessState::Stopped);
        let (events_tx, events) = mpsc::unbounded_channel();
        let actor = SupervisorActor {
            settings,
            spawner,
            serializer,
            hub,
            resync,
            state: state_tx,
            events_tx,
            events,
            instance: 0,
            process: None,
            restart: None,
            last_seq: 0,
            decoder: Utf8Stream::default(),
        };
        let task = tokio::spawn(actor.run(control_rx));
        Self {
            control,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Cancels any pending restart, kills the process and waits for it to
    /// exit. Safe to call more than once.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.control.send(Control::Stop(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(target: "pier::supervisor", error = %err, "supervisor task ended abnormally");
            }
        }
    }
}

struct SupervisorActor {
    settings: SupervisorSettings,
    spawner: Arc<dyn ProcessSpawner>,
    serializer: Arc<ModelSerializer>,
    hub: FanoutHub,
    resync: ResyncCoordinator,
    state: watch::Sender<ProcessState>,
    events_tx: mpsc::UnboundedSender<(u64, UpstreamEvent)>,
    events: mpsc::UnboundedReceiver<(u64, UpstreamEvent)>,
    instance: u64,
    process: Option<Box<dyn ProcessHandle>>,
    restart: Option<Pin<Box<Sleep>>>,
    last_seq: Seq,
    decoder: Utf8Stream,
}

impl SupervisorActor {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) {
        self.launch().await;
        loop {
            tokio::select! {
                command = control.recv() => {
                    self.shutdown().await;
                    if let Some(Control::Stop(reply)) = command {
                        let _ = reply.send(());
                    }
                    return;
                }
                Some((instance, event)) = self.events.recv() => {
                    self.handle_event(instance, event);
                }
                () = restart_elapsed(&mut self.restart) => {
                    self.restart = None;
                    counter!("beach_pier_restarts_total", 1);
                    info!(target: "pier::supervisor", "restarting upstream process");
                    self.launch().await;
                }
            }
        }
    }

    async fn launch(&mut self) {
        self.set_state(ProcessState::Starting);
        self.hub.broadcast_status(ProcessStatus::Starting);
        self.instance += 1;
        self.decoder.reset();

        let geometry = self.settings.geometry;
        let sink = EventSink::new(self.instance, self.events_tx.clone());
        match self.spawner.spawn(&self.settings.command, geometry, sink) {
            Ok(process) => self.process = Some(process),
            Err(err) => {
                warn!(
                    target: "pier::supervisor",
                    program = %self.settings.command.program,
                    error = %err,
                    "failed to spawn upstream process"
                );
                self.on_exit(ExitReport::default());
                return;
            }
        }
        info!(
            target: "pier::supervisor",
            program = %self.settings.command.program,
            instance = self.instance,
            cols = geometry.cols,
            rows = geometry.rows,
            "upstream process started"
        );

        // Output from the new process is not handled until this returns, so
        // the reset lands ahead of every chunk it emits.
        if let Err(err) = self.serializer.reset(geometry.cols, geometry.rows).await {
            warn!(target: "pier::supervisor", error = %err, "failed to reset screen model");
        }
        if let Some(process) = &self.process {
            if let Err(err) = process.resize(geometry) {
                debug!(target: "pier::supervisor", error = %err, "failed to apply pty geometry");
            }
        }
        self.set_state(ProcessState::Running);
        self.hub.broadcast_status(ProcessStatus::Running);
        self.resync
            .broadcast_snapshot(|_| true, "backend-restarting")
            .await;
    }

    fn handle_event(&mut self, instance: u64, event: UpstreamEvent) {
        if instance != self.instance {
            debug!(target: "pier::supervisor", instance, "ignoring event from a replaced process");
            return;
        }
        match event {
            UpstreamEvent::Output(bytes) => self.forward(bytes),
            UpstreamEvent::Exited(report) => self.on_exit(report),
        }
    }

    fn forward(&mut self, bytes: Vec<u8>) {
        self.last_seq += 1;
        let seq = self.last_seq;
        let text = self.decoder.push(&bytes);
        self.serializer.mirror(seq, bytes);
        if text.is_empty() {
            return;
        }
        match LiveChunk::new(seq, &text) {
            Ok(chunk) => self.hub.broadcast_chunk(&chunk),
            Err(err) => warn!(target: "pier::supervisor", seq, error = %err, "failed to encode chunk"),
        }
    }

    fn on_exit(&mut self, report: ExitReport) {
        self.process = None;
        self.set_state(ProcessState::Exited);
        info!(
            target: "pier::supervisor",
            code = ?report.code,
            signal = ?report.signal,
            restart_in_ms = self.settings.restart_delay.as_millis() as u64,
            "upstream process exited"
        );
        self.hub.broadcast_status(ProcessStatus::Exited(report));
        self.restart = Some(Box::pin(time::sleep(self.settings.restart_delay)));
    }

    async fn shutdown(&mut self) {
        self.restart = None;
        self.set_state(ProcessState::Stopping);

        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.kill() {
                warn!(target: "pier::supervisor", error = %err, "failed to signal upstream process");
            }
            let instance = self.instance;
            let events = &mut self.events;
            let exited = time::timeout(EXIT_WAIT, async move {
                while let Some((from, event)) = events.recv().await {
                    if from != instance {
                        continue;
                    }
                    if let UpstreamEvent::Exited(report) = event {
                        return Some(report);
                    }
                }
                None
            })
            .await;
            match exited {
                Ok(Some(report)) => self.hub.broadcast_status(ProcessStatus::Exited(report)),
                Ok(None) => {}
                Err(_) => warn!(
                    target: "pier::supervisor",
                    wait_secs = EXIT_WAIT.as_secs(),
                    "upstream process did not report exit after kill"
                ),
            }
        }

        self.set_state(ProcessState::Stopped);
        info!(target: "pier::supervisor", "supervisor stopped");
    }

    fn set_state(&self, state: ProcessState) {
        self.state.send_replace(state);
    }
}

async fn restart_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{FlowLimits, Outbound, ViewerInbox};
    use crate::screen::{RecordingScreen, ScreenCall};
    use crate::serializer::MirroredScreen;
    use crate::upstream::FakeSpawner;
    use beach_pier_core::ServerMessage;
    use tokio::time::Instant;

    struct Harness {
        supervisor: Supervisor,
        fake: FakeSpawner,
        screen: RecordingScreen,
        inbox: ViewerInbox,
    }

    const DELAY: Duration = Duration::from_millis(1000);

    fn harness(fake: FakeSpawner) -> Harness {
        let (hub, _recovery) = FanoutHub::new(FlowLimits::new(1 << 20));
        let screen = RecordingScreen::new();
        let serializer = Arc::new(ModelSerializer::spawn(MirroredScreen::new(Box::new(
            screen.clone(),
        ))));
        let resync = ResyncCoordinator::new(hub.clone(), serializer.clone());
        let inbox = hub.attach();
        let supervisor = Supervisor::spawn(
            SupervisorSettings {
                command: Command::new("fake-shell").args(["-l"]),
                geometry: Geometry::new(80, 24),
                restart_delay: DELAY,
            },
            Arc::new(fake.clone()),
            serializer,
            hub,
            resync,
        );
        Harness {
            supervisor,
            fake,
            screen,
            inbox,
        }
    }

    async fn next_message(inbox: &mut ViewerInbox) -> ServerMessage {
        match inbox.recv().await {
            Some(Outbound::Frame(frame)) => {
                inbox.mark_sent(frame.len());
                ServerMessage::from_text(&frame).unwrap()
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    async fn expect_startup(inbox: &mut ViewerInbox) {
        assert_eq!(
            next_message(inbox).await,
            ServerMessage::Status(ProcessStatus::Starting)
        );
        assert_eq!(
            next_message(inbox).await,
            ServerMessage::Status(ProcessStatus::Running)
        );
        assert!(matches!(
            next_message(inbox).await,
            ServerMessage::History { .. }
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn launch_resets_the_model_and_publishes_a_clean_snapshot() {
        let mut h = harness(FakeSpawner::new());
        expect_startup(&mut h.inbox).await;
        assert_eq!(h.supervisor.state(), ProcessState::Running);

        assert!(h.fake.emit(b"A"));
        assert!(h.fake.emit(b"B"));
        assert_eq!(next_message(&mut h.inbox).await, ServerMessage::data("A", 1));
        assert_eq!(next_message(&mut h.inbox).await, ServerMessage::data("B", 2));

        let (command, geometry) = h.fake.spawns().remove(0);
        assert_eq!(command.args, vec!["-l".to_string()]);
        assert_eq!(geometry, Geometry::new(80, 24));
        assert_eq!(h.fake.resizes(), vec![Geometry::new(80, 24)]);
        h.supervisor.stop().await;
        assert_eq!(
            h.screen.calls()[..3],
            [
                ScreenCall::Reset { cols: 80, rows: 24 },
                ScreenCall::Serialize,
                ScreenCall::Write(b"A".to_vec()),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn exit_is_broadcast_and_restart_follows_the_delay() {
        let mut h = harness(FakeSpawner::new());
        expect_startup(&mut h.inbox).await;

        let exited_at = Instant::now();
        assert!(h.fake.exit(ExitReport::code(1)));
        assert_eq!(
            next_message(&mut h.inbox).await,
            ServerMessage::Status(ProcessStatus::Exited(ExitReport::code(1)))
        );
        assert_eq!(h.supervisor.state(), ProcessState::Exited);

        h.fake.wait_for_spawns(2).await;
        assert!(exited_at.elapsed() >= DELAY);
        expect_startup(&mut h.inbox).await;
        h.supervisor.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn spawn_failure_reports_exit_and_retries() {
        let fake = FakeSpawner::new();
        fake.fail_next_spawns(1);
        let mut h = harness(fake);

        assert_eq!(
            next_message(&mut h.inbox).await,
            ServerMessage::Status(ProcessStatus::Starting)
        );
        assert_eq!(
            next_message(&mut h.inbox).await,
            ServerMessage::Status(ProcessStatus::Exited(ExitReport::default()))
        );
        h.fake.wait_for_spawns(1).await;
        expect_startup(&mut h.inbox).await;
        h.supervisor.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stop_cancels_a_pending_restart() {
        let mut h = harness(FakeSpawner::new());
        expect_startup(&mut h.inbox).await;
        h.fake.exit(ExitReport::signal("SIGSEGV"));
        let _ = next_message(&mut h.inbox).await;

        h.supervisor.stop().await;
        assert_eq!(h.supervisor.state(), ProcessState::Stopped);
        time::sleep(DELAY * 5).await;
        assert_eq!(h.fake.spawn_count(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_kills_the_running_process_and_waits_for_exit() {
        let mut h = harness(FakeSpawner::new());
        expect_startup(&mut h.inbox).await;

        h.supervisor.stop().await;
        assert_eq!(h.fake.kill_count(), 1);
        assert!(!h.fake.is_running());
        assert_eq!(
            next_message(&mut h.inbox).await,
            ServerMessage::Status(ProcessStatus::Exited(ExitReport::signal("SIGKILL")))
        );
        assert_eq!(h.supervisor.state(), ProcessState::Stopped);
        h.supervisor.stop().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn split_utf8_is_sent_once_complete() {
        let mut h = harness(FakeSpawner::new());
        expect_startup(&mut h.inbox).await;

        let euro = "\u{20ac}".as_bytes();
        h.fake.emit(&euro[..2]);
        h.fake.emit(&euro[2..]);
        assert_eq!(
            next_message(&mut h.inbox).await,
            ServerMessage::data("\u{20ac}", 2)
        );
        h.supervisor.stop().await;
        let writes = h
            .screen
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ScreenCall::Write(_)))
            .count();
        assert_eq!(writes, 2);
    }
}
