//! Client resync state machine.
//!
//! Sans-IO: every input is an event method and every effect comes back as an
//! [`Action`] for the runner to carry out. The machine never touches a socket,
//! a timer or the terminal itself.

use beach_pier_core::{
    ClientMessage, ProcessStatus, ResyncReason, ResyncTrigger, Seq, ServerMessage,
};
use tracing::{debug, info, warn};

use crate::buffer::ByteWindow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(ClientMessage),
    /// Start the resync timeout, replacing any armed one.
    ArmTimeout,
    CancelTimeout,
    /// Clear the display and home the cursor.
    ResetDisplay,
    Write(String),
    Status(ProcessStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Resyncing(ResyncTrigger),
}

#[derive(Debug)]
pub struct ResyncMachine {
    state: SyncState,
    buffer: ByteWindow,
    last_snapshot: Option<String>,
    applied_through: Option<Seq>,
}

impl ResyncMachine {
    pub fn new(buffer_bytes: usize) -> Self {
        Self {
            state: SyncState::Resyncing(ResyncTrigger::Connect),
            buffer: ByteWindow::new(buffer_bytes),
            last_snapshot: None,
            applied_through: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn on_connected(&mut self, reconnect: bool) -> Vec<Action> {
        let trigger = if reconnect {
            ResyncTrigger::Reconnect
        } else {
            ResyncTrigger::Connect
        };
        self.begin(trigger, true)
    }

    /// An explicit request for a fresh snapshot, e.g. `manual` or `overflow`.
    pub fn on_trigger(&mut self, trigger: ResyncTrigger) -> Vec<Action> {
        self.begin(trigger, true)
    }

    pub fn on_visibility(&mut self) -> Vec<Action> {
        match self.state {
            SyncState::Synced => self.begin(ResyncTrigger::Visibility, true),
            SyncState::Resyncing(_) => vec![Action::ArmTimeout],
        }
    }

    pub fn on_timeout(&mut self) -> Vec<Action> {
        match self.state {
            SyncState::Resyncing(trigger) => {
                let reason = ResyncReason::new(trigger).timed_out();
                warn!(target: "pier::client", %reason, "no snapshot before timeout; asking again");
                vec![
                    Action::Send(ClientMessage::request_history(reason)),
                    Action::ArmTimeout,
                ]
            }
            SyncState::Synced => Vec::new(),
        }
    }

    pub fn on_disconnected(&mut self) -> Vec<Action> {
        vec![Action::CancelTimeout]
    }

    pub fn on_server_message(&mut self, message: ServerMessage) -> Vec<Action> {
        match message {
            ServerMessage::Status(status) => self.on_status(status),
            ServerMessage::Data { data, seq } => self.on_data(data, seq),
            ServerMessage::History { data, seq } => self.on_history(data, seq),
            ServerMessage::Error { message } => {
                warn!(target: "pier::client", %message, "server rejected a message");
                Vec::new()
            }
        }
    }

    fn on_status(&mut self, status: ProcessStatus) -> Vec<Action> {
        // A restarting backend pushes its own snapshot once it is running.
        let mut actions = if status == ProcessStatus::Starting {
            self.begin(ResyncTrigger::BackendRestarting, false)
        } else {
            Vec::new()
        };
        actions.insert(0, Action::Status(status));
        actions
    }

    fn on_data(&mut self, data: String, seq: Option<Seq>) -> Vec<Action> {
        match self.state {
            SyncState::Resyncing(_) => {
                self.buffer.push(seq, data);
                Vec::new()
            }
            SyncState::Synced => {
                if let (Some(seq), Some(applied)) = (seq, self.applied_through) {
                    if seq <= applied {
                        debug!(target: "pier::client", seq, applied, "skipping chunk already in snapshot");
                        return Vec::new();
                    }
                }
                self.note_applied(seq);
                vec![Action::Write(data)]
            }
        }
    }

    fn on_history(&mut self, data: String, seq: Option<Seq>) -> Vec<Action> {
        let mut actions = Vec::new();
        let resyncing = !self.is_synced();
        if resyncing || self.last_snapshot.as_deref() != Some(data.as_str()) {
            actions.push(Action::CancelTimeout);
            actions.push(Action::ResetDisplay);
            actions.push(Action::Write(data.clone()));
            self.applied_through = seq;
            self.last_snapshot = Some(data);
            self.state = SyncState::Synced;
            info!(target: "pier::client", ?seq, "snapshot applied");
        } else if seq > self.applied_through {
            self.applied_through = seq;
        }

        let flush = self.buffer.drain_after(seq);
        if flush.gap {
            warn!(target: "pier::client", "buffer overflowed past the snapshot; resyncing");
            actions.extend(self.begin(ResyncTrigger::Overflow, true));
            return actions;
        }
        for (piece_seq, text) in flush.pieces {
            self.note_applied(piece_seq);
            actions.push(Action::Write(text));
        }
        actions
    }

    fn begin(&mut self, trigger: ResyncTrigger, request: bool) -> Vec<Action> {
        debug!(target: "pier::client", trigger = trigger.as_str(), request, "resync started");
        self.state = SyncState::Resyncing(trigger);
        self.buffer.clear();
        let mut actions = Vec::with_capacity(2);
        if request {
            actions.push(Action::Send(ClientMessage::request_history(
                ResyncReason::new(trigger),
            )));
        }
        actions.push(Action::ArmTimeout);
        actions
    }

    fn note_applied(&mut self, seq: Option<Seq>) {
        if seq > self.applied_through {
            self.applied_through = seq;
        }
    }
}
