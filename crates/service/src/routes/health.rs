//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pending_messages: usize,
    pub dead_letters: usize,
}

/// GET /health: liveness plus the depth of the message queue.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pending_messages: state.bus.pending().await,
        dead_letters: state.bus.dead_letters().await.len(),
    })
}
