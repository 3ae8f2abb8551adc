//! HTTP surface: `/ws` for viewers, `/healthz` and `/metrics` for operators.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beach_pier_core::{ClientMessage, ResyncReason};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::fanout::Outbound;
use crate::service::PierService;

pub struct AppState {
    pub service: Arc<PierService>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    process: &'static str,
    viewers: usize,
    deferred: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.service.hub().stats();
    Json(HealthResponse {
        status: "ok",
        process: state.service.process_state().as_str(),
        viewers: stats.viewers,
        deferred: stats.deferred,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let resync = match state.service.resync() {
        Ok(resync) => resync,
        Err(err) => {
            warn!(target: "pier::ws", error = %err, "rejecting viewer");
            let _ = ws_tx.send(Message::Close(Some(going_away("service not running")))).await;
            return;
        }
    };
    let hub = state.service.hub().clone();
    let mut inbox = hub.attach();
    let id = inbox.id();
    info!(target: "pier::ws", viewer = %id, "viewer connected");

    let writer = tokio::spawn(async move {
        while let Some(outbound) = inbox.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let bytes = frame.len();
                    if ws_tx.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                    inbox.mark_sent(bytes);
                }
                Outbound::Close => {
                    let _ = ws_tx
                        .send(Message::Close(Some(going_away("server shutting down"))))
                        .await;
                    break;
                }
            }
        }
        debug!(target: "pier::ws", viewer = %id, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        let parsed = match message {
            Ok(Message::Text(text)) => ClientMessage::from_text(&text),
            Ok(Message::Binary(bytes)) => ClientMessage::from_binary(&bytes),
            Ok(Message::Close(frame)) => {
                info!(
                    target: "pier::ws",
                    viewer = %id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "viewer closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(target: "pier::ws", viewer = %id, error = %err, "error receiving message");
                break;
            }
        };

        match parsed {
            Ok(ClientMessage::RequestHistory { reason }) => {
                match reason.parse::<ResyncReason>() {
                    Ok(parsed) => debug!(
                        target: "pier::ws",
                        viewer = %id,
                        reason = %parsed,
                        timed_out = parsed.timed_out,
                        "history requested"
                    ),
                    Err(_) => warn!(
                        target: "pier::ws",
                        viewer = %id,
                        reason = %reason,
                        "history requested with unknown reason"
                    ),
                }
                resync.request_snapshot(id, &reason).await;
            }
            Err(err) => {
                counter!("beach_pier_invalid_frames_total", 1);
                warn!(target: "pier::ws", viewer = %id, error = %err, "invalid client frame");
                hub.send_error(id, format!("invalid message: {err}"));
            }
        }
    }

    hub.detach(id);
    writer.abort();
    info!(target: "pier::ws", viewer = %id, "viewer disconnected");
}

fn going_away(reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: close_code::AWAY,
        reason: Cow::Borrowed(reason),
    }
}
