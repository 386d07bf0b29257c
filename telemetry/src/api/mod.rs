//! HTTP and WebSocket routes for run observers.
//!
//! - `GET /health`
//! - `GET /runs` - registered runs and their states
//! - `GET /runs/{run_id}/status` - coordinator snapshot
//! - `GET /runs/{run_id}/report` - self-contained HTML report
//! - `GET /runs/{run_id}/ws` - live channel + control commands

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

pub mod observer_ws;
pub mod runs;

use crate::registry::RunRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: RunRegistry,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/runs", get(runs::list_runs))
        .route("/runs/{run_id}/status", get(runs::get_run_status))
        .route("/runs/{run_id}/report", get(runs::get_run_report))
        .route("/runs/{run_id}/ws", get(observer_ws::observer_websocket))
}

pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "run-telemetry",
            "version": env!("CARGO_PKG_VERSION"),
            "active_runs": state.registry.run_ids().len(),
        })),
    )
}
