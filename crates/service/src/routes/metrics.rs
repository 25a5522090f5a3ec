//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;

use crate::AppState;

/// GET /metrics: Prometheus text exposition, with queue gauges sampled at
/// scrape time.
pub async fn get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    metrics::gauge!("message_queue_depth").set(state.bus.pending().await as f64);
    metrics::gauge!("message_dead_letters").set(state.bus.dead_letters().await.len() as f64);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}
