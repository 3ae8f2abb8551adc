use std::sync::Arc;
use std::time::Duration;

use beach_pier_core::{ExitReport, ProcessStatus, ServerMessage};
use beach_pier_server::fanout::{Flow, FlowLimits, Outbound, ViewerInbox};
use beach_pier_server::screen::{RecordingScreen, ScreenCall};
use beach_pier_server::supervisor::ProcessState;
use beach_pier_server::upstream::{Command, FakeSpawner, Geometry};
use beach_pier_server::{PierService, ServiceConfig};
use serde_json::{json, Value};
use tokio::time::{self, Instant};

const RESTART_DELAY: Duration = Duration::from_millis(1500);

struct Pier {
    service: PierService,
    fake: FakeSpawner,
    screen: RecordingScreen,
}

fn pier(high_water: usize, snapshot_interval: Duration) -> Pier {
    let fake = FakeSpawner::new();
    let screen = RecordingScreen::new();
    let config = ServiceConfig {
        command: Some(Command::new("fake-shell")),
        geometry: Geometry::new(80, 24),
        restart_delay: RESTART_DELAY,
        snapshot_interval,
        flow: FlowLimits::new(high_water),
    };
    let service = PierService::new(config, Arc::new(fake.clone()), Box::new(screen.clone()));
    Pier {
        service,
        fake,
        screen,
    }
}

/// Reads one frame the way a socket writer would, acknowledging its bytes.
async fn next_frame(inbox: &mut ViewerInbox) -> String {
    match inbox.recv().await {
        Some(Outbound::Frame(frame)) => {
            inbox.mark_sent(frame.len());
            frame.to_string()
        }
        other => panic!("expected a frame, got {other:?}"),
    }
}

async fn next_message(inbox: &mut ViewerInbox) -> ServerMessage {
    ServerMessage::from_text(&next_frame(inbox).await).unwrap()
}

async fn expect_startup(inbox: &mut ViewerInbox) -> ServerMessage {
    assert_eq!(
        next_message(inbox).await,
        ServerMessage::Status(ProcessStatus::Starting)
    );
    assert_eq!(
        next_message(inbox).await,
        ServerMessage::Status(ProcessStatus::Running)
    );
    let history = next_message(inbox).await;
    assert!(matches!(history, ServerMessage::History { .. }), "got {history:?}");
    history
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test_timeout::tokio_timeout_test]
async fn early_viewer_sees_empty_history_then_every_chunk_in_order() {
    let pier = pier(1 << 20, Duration::ZERO);
    let mut inbox = pier.service.hub().attach();
    pier.service.start().unwrap();

    let history = expect_startup(&mut inbox).await;
    assert_eq!(
        history,
        ServerMessage::History {
            data: String::new(),
            seq: None
        }
    );

    assert!(pier.fake.emit(b"A"));
    assert!(pier.fake.emit(b"B"));
    assert_eq!(next_message(&mut inbox).await, ServerMessage::data("A", 1));
    assert_eq!(next_message(&mut inbox).await, ServerMessage::data("B", 2));

    pier.service.stop().await.unwrap();
}

#[test_timeout::tokio_timeout_test]
async fn backed_up_viewer_skips_live_chunks_and_catches_up_from_one_snapshot() {
    let pier = pier(32, Duration::ZERO);
    let mut inbox = pier.service.hub().attach();
    let id = inbox.id();
    pier.service.start().unwrap();

    // Leave the startup frames unacknowledged so the backlog sits above
    // high water when the next chunks arrive.
    let hub = pier.service.hub().clone();
    eventually("startup snapshot", || {
        hub.viewer(id)
            .is_some_and(|info| info.last_snapshot_at.is_some())
    })
    .await;
    assert!(inbox.backlog() > 32);

    assert!(pier.fake.emit(b"C"));
    assert!(pier.fake.emit(b"D"));
    let screen = pier.screen.clone();
    eventually("C and D mirrored", || screen.text() == "CD").await;
    assert_eq!(hub.viewer(id).map(|info| info.flow), Some(Flow::Deferred));
    assert_eq!(hub.stats().deferred, 1);

    let mut drained = Vec::new();
    while let Some(Outbound::Frame(frame)) = inbox.try_recv() {
        drained.push(frame);
    }
    for frame in &drained {
        let message = ServerMessage::from_text(frame).unwrap();
        assert!(
            !matches!(message, ServerMessage::Data { .. }),
            "deferred viewer received live data: {message:?}"
        );
    }
    let drained_bytes = drained.iter().map(|frame| frame.len()).sum();
    inbox.mark_sent(drained_bytes);

    assert_eq!(
        next_message(&mut inbox).await,
        ServerMessage::history("CD", 2)
    );
    assert_eq!(hub.viewer(id).map(|info| info.flow), Some(Flow::Normal));

    assert!(pier.fake.emit(b"E"));
    assert_eq!(next_message(&mut inbox).await, ServerMessage::data("E", 3));
    assert!(inbox.try_recv().is_none(), "one snapshot per deferred episode");

    pier.service.stop().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn exit_is_broadcast_and_the_process_restarts_after_the_delay() {
    let pier = pier(1 << 20, Duration::ZERO);
    let mut first = pier.service.hub().attach();
    let mut second = pier.service.hub().attach();
    pier.service.start().unwrap();
    expect_startup(&mut first).await;
    expect_startup(&mut second).await;

    assert!(pier.fake.emit(b"A"));
    assert_eq!(next_message(&mut first).await, ServerMessage::data("A", 1));
    assert_eq!(next_message(&mut second).await, ServerMessage::data("A", 1));

    assert!(pier.fake.exit(ExitReport::code(1)));
    let exited_at = Instant::now();
    let expected = json!({"type": "status", "status": "exited", "code": 1, "signal": null});
    for inbox in [&mut first, &mut second] {
        let frame: Value = serde_json::from_str(&next_frame(inbox).await).unwrap();
        assert_eq!(frame, expected);
    }
    assert_eq!(pier.service.process_state(), ProcessState::Exited);

    pier.fake.wait_for_spawns(2).await;
    assert!(exited_at.elapsed() >= RESTART_DELAY);

    // The fresh instance starts from a reset model, and the snapshot still
    // carries the last sequence number so later chunks continue from it.
    for inbox in [&mut first, &mut second] {
        assert_eq!(
            expect_startup(inbox).await,
            ServerMessage::History {
                data: String::new(),
                seq: Some(1)
            }
        );
    }
    assert!(pier.fake.emit(b"B"));
    assert_eq!(next_message(&mut first).await, ServerMessage::data("B", 2));

    pier.service.stop().await.unwrap();
}

#[test_timeout::tokio_timeout_test(paused)]
async fn stop_kills_the_process_closes_viewers_and_silences_timers() {
    let pier = pier(1 << 20, Duration::from_secs(1));
    let mut inbox = pier.service.hub().attach();
    pier.service.start().unwrap();
    expect_startup(&mut inbox).await;

    pier.service.stop().await.unwrap();
    assert_eq!(pier.fake.kill_count(), 1);
    assert!(!pier.fake.is_running());
    assert!(pier.service.hub().is_empty());
    assert!(pier.screen.is_disposed());
    assert_eq!(pier.service.process_state(), ProcessState::Stopped);

    let mut last = None;
    while let Some(outbound) = inbox.try_recv() {
        last = Some(outbound);
    }
    assert!(matches!(last, Some(Outbound::Close)));

    let calls = pier.screen.calls().len();
    time::sleep(RESTART_DELAY * 10).await;
    assert_eq!(pier.fake.spawn_count(), 1);
    assert_eq!(pier.screen.calls().len(), calls);
    assert_eq!(pier.screen.calls().last(), Some(&ScreenCall::Dispose));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn stop_during_restart_delay_cancels_the_restart() {
    let pier = pier(1 << 20, Duration::ZERO);
    let mut inbox = pier.service.hub().attach();
    pier.service.start().unwrap();
    expect_startup(&mut inbox).await;

    assert!(pier.fake.exit(ExitReport::signal("SIGTERM")));
    assert!(matches!(
        next_message(&mut inbox).await,
        ServerMessage::Status(ProcessStatus::Exited(_))
    ));

    pier.service.stop().await.unwrap();
    time::sleep(RESTART_DELAY * 4).await;
    assert_eq!(pier.fake.spawn_count(), 1);
    assert_eq!(pier.fake.kill_count(), 0);
}
