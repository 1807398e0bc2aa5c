//! Health check endpoint for load balancers and monitoring.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use std::sync::Arc;

use crate::GatewayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Open signaling connections.
    pub sessions: usize,
    pub presenters: usize,
    pub viewers: usize,
    pub queued_candidates: usize,
}

/// Health check router.
pub fn router() -> Router<Arc<GatewayState>> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    let stats = state.handler.registry().stats().await;

    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        sessions: state.sessions.active_count().await,
        presenters: stats.presenters,
        viewers: stats.viewers,
        queued_candidates: stats.queued_candidates,
    })
}
