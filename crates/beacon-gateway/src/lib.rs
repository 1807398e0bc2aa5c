//! # beacon-gateway
//!
//! WebSocket gateway for Beacon signaling. Handles:
//! - Connection accept and session id assignment
//! - Frame routing between the socket and the signaling handler
//! - Disconnect detection and session teardown
//! - `/health` for load balancers
//!
//! Each connection gets one outbound channel drained by a sender task, so
//! replies, pushed candidates and `stopCommunication` from other sessions'
//! teardowns all reach the socket in order.

pub mod health;
pub mod session;

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use beacon_common::SessionId;
use beacon_signaling::{ConnectionHandle, SignalingHandler};
use futures_util::{SinkExt, StreamExt};
use session::SessionTracker;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Gateway state.
#[derive(Clone)]
pub struct GatewayState {
    pub handler: SignalingHandler,
    pub sessions: Arc<SessionTracker>,
    pub started: Instant,
}

impl GatewayState {
    pub fn new(handler: SignalingHandler) -> Self {
        Self {
            handler,
            sessions: Arc::new(SessionTracker::new()),
            started: Instant::now(),
        }
    }
}

/// Build the gateway router: the signaling WebSocket at `ws_path` plus
/// `/health`. Serve it with connect info so peers can be logged by address.
pub fn build_router(state: GatewayState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .merge(health::router())
        .with_state(Arc::new(state))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, remote, state))
}

/// Handle a single WebSocket connection.
async fn handle_connection(socket: WebSocket, remote: SocketAddr, state: Arc<GatewayState>) {
    let (mut sender, mut receiver) = socket.split();

    let session_id = state.sessions.open(Some(remote.to_string())).await;
    let (conn, mut outbound) = ConnectionHandle::channel(session_id);
    tracing::info!(session = %session_id, remote = %remote, "Connection received");

    // ── Sender task ──────────────────────────────────────────────────────────
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(session = %session_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // ── Receive loop ─────────────────────────────────────────────────────────
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                tracing::debug!(session = %session_id, message = %text.as_str(), "Connection message");
                state.handler.handle_text(&conn, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Connection error");
                break;
            }
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────
    close_session(&state, session_id).await;
    drop(conn);
    send_task.abort();
}

async fn close_session(state: &GatewayState, session_id: SessionId) {
    state.handler.disconnect(session_id).await;
    if let Some(session) = state.sessions.close(session_id).await {
        let secs = (chrono::Utc::now() - session.connected_at).num_seconds();
        tracing::info!(session = %session_id, connected_secs = secs, "Connection closed");
    }
}
