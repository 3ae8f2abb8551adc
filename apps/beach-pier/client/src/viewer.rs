//! WebSocket runner that drives the resync and connection state machines.

use std::future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use beach_pier_core::{ProtocolError, ResyncTrigger, ServerMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::{ConnectionMachine, ConnectionState, ReconnectBackoff};
use crate::resync::{Action, ResyncMachine};
use crate::sink::TerminalSink;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub url: String,
    pub buffer_bytes: usize,
    pub resync_timeout: Duration,
    pub backoff: ReconnectBackoff,
}

impl ViewerConfig {
    pub const DEFAULT_BUFFER_BYTES: usize = 1 << 20;
    pub const DEFAULT_RESYNC_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer_bytes: Self::DEFAULT_BUFFER_BYTES,
            resync_timeout: Self::DEFAULT_RESYNC_TIMEOUT,
            backoff: ReconnectBackoff::default(),
        }
    }
}

/// Requests from outside the runner, e.g. signal handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Manual,
    Visibility,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("terminal output failed: {0}")]
    Sink(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

pub struct Viewer<S> {
    config: ViewerConfig,
    sink: S,
    machine: ResyncMachine,
    connection: ConnectionMachine,
}

impl<S: TerminalSink> Viewer<S> {
    pub fn new(config: ViewerConfig, sink: S) -> Self {
        let machine = ResyncMachine::new(config.buffer_bytes);
        let connection = ConnectionMachine::new(config.backoff.clone());
        Self {
            config,
            sink,
            machine,
            connection,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connects, renders, and reconnects until told to shut down or the
    /// control channel closes. Hands the sink back when done.
    pub async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) -> Result<S, ViewerError> {
        loop {
            self.connection.connecting();
            debug!(target: "pier::client", url = %self.config.url, "connecting");

            let connect = connect_async(self.config.url.clone());
            tokio::pin!(connect);
            let attempt = loop {
                tokio::select! {
                    attempt = &mut connect => break attempt,
                    command = control.recv() => match command {
                        Some(Control::Shutdown) | None => return Ok(self.sink),
                        Some(other) => debug!(target: "pier::client", ?other, "ignored while connecting"),
                    },
                }
            };

            match attempt {
                Ok((socket, _)) => {
                    let reconnect = self.connection.opened();
                    info!(target: "pier::client", url = %self.config.url, reconnect, "connected");
                    if let SessionEnd::Shutdown = self.session(socket, reconnect, &mut control).await? {
                        return Ok(self.sink);
                    }
                }
                Err(err) => {
                    warn!(target: "pier::client", url = %self.config.url, error = %err, "connection attempt failed");
                }
            }

            let delay = self.connection.closed();
            info!(
                target: "pier::client",
                delay_ms = delay.as_millis() as u64,
                "disconnected; retrying after delay"
            );
            let wait = time::sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    () = &mut wait => break,
                    command = control.recv() => match command {
                        Some(Control::Shutdown) | None => return Ok(self.sink),
                        Some(other) => debug!(target: "pier::client", ?other, "ignored while disconnected"),
                    },
                }
            }
        }
    }

    async fn session(
        &mut self,
        socket: Socket,
        reconnect: bool,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Result<SessionEnd, ViewerError> {
        let (mut tx, mut rx) = socket.split();
        let mut timeout: Option<Pin<Box<Sleep>>> = None;
        let mut actions = self.machine.on_connected(reconnect);

        loop {
            if !self.apply(actions, &mut tx, &mut timeout).await? {
                break;
            }
            actions = tokio::select! {
                message = rx.next() => match message {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_text(&text) {
                        Ok(message) => self.machine.on_server_message(message),
                        Err(err) => {
                            warn!(target: "pier::client", error = %err, "ignoring malformed server frame");
                            Vec::new()
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            target: "pier::client",
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "server closed websocket"
                        );
                        break;
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(err)) => {
                        warn!(target: "pier::client", error = %err, "error receiving message");
                        break;
                    }
                    None => break,
                },
                () = timer_elapsed(&mut timeout) => {
                    timeout = None;
                    self.machine.on_timeout()
                }
                command = control.recv() => match command {
                    Some(Control::Manual) => self.machine.on_trigger(ResyncTrigger::Manual),
                    Some(Control::Visibility) => self.machine.on_visibility(),
                    Some(Control::Shutdown) | None => {
                        let _ = tx.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                },
            };
        }

        let actions = self.machine.on_disconnected();
        self.apply(actions, &mut tx, &mut timeout).await?;
        Ok(SessionEnd::Disconnected)
    }

    /// Carries out machine actions. Returns `false` once the socket is gone.
    async fn apply(
        &mut self,
        actions: Vec<Action>,
        tx: &mut SocketSink,
        timeout: &mut Option<Pin<Box<Sleep>>>,
    ) -> Result<bool, ViewerError> {
        for action in actions {
            match action {
                Action::Send(message) => {
                    let text = message.to_text()?;
                    if let Err(err) = tx.send(Message::Text(text)).await {
                        warn!(target: "pier::client", error = %err, "failed to send request");
                        return Ok(false);
                    }
                }
                Action::ArmTimeout => {
                    *timeout = Some(Box::pin(time::sleep(self.config.resync_timeout)));
                }
                Action::CancelTimeout => *timeout = None,
                Action::ResetDisplay => self.sink.reset()?,
                Action::Write(text) => self.sink.write(&text)?,
                Action::Status(status) => {
                    info!(target: "pier::client", ?status, "process status");
                }
            }
        }
        Ok(true)
    }
}

async fn timer_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}
