use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::json;
use shared_types::RunId;

use crate::api::ApiState;
use crate::registry::is_valid_run_id;
use crate::report::{render_run_report, ReportError};

fn invalid_run_id(run_id: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid run id", "run_id": run_id })),
    )
        .into_response()
}

fn run_not_found(run_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "run not found", "run_id": run_id })),
    )
        .into_response()
}

pub async fn list_runs(State(state): State<ApiState>) -> impl IntoResponse {
    let runs: Vec<_> = state
        .registry
        .run_ids()
        .into_iter()
        .filter_map(|run_id| state.registry.get(&run_id))
        .map(|handle| {
            json!({
                "run_id": handle.run_id,
                "status": handle.coordinator.state(),
                "subscribers": state.registry.hub().subscriber_count(&handle.run_id),
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({ "runs": runs })))
}

pub async fn get_run_status(
    Path(run_id): Path<String>,
    State(state): State<ApiState>,
) -> Response {
    if !is_valid_run_id(&run_id) {
        return invalid_run_id(&run_id);
    }
    let Some(handle) = state.registry.get(&RunId(run_id.clone())) else {
        return run_not_found(&run_id);
    };

    match handle.coordinator.status().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => {
            tracing::warn!(run_id = %run_id, error = %e, "Status query failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string(), "run_id": run_id })),
            )
                .into_response()
        }
    }
}

/// Renders from the persisted trace, so it also works for runs that are no
/// longer registered (pruned, or from a previous process).
pub async fn get_run_report(
    Path(run_id): Path<String>,
    State(state): State<ApiState>,
) -> Response {
    if !is_valid_run_id(&run_id) {
        return invalid_run_id(&run_id);
    }
    let run_id = RunId(run_id);
    let run_finished = state
        .registry
        .get(&run_id)
        .map_or(true, |handle| handle.coordinator.state().is_terminal());
    let run_dir = state.registry.run_dir(&run_id);

    match render_run_report(&run_dir, &format!("Run {run_id}"), run_finished).await {
        Ok(html) => (StatusCode::OK, Html(html)).into_response(),
        Err(ReportError::NotFound(_)) => run_not_found(run_id.as_str()),
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Report rendering failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string(), "run_id": run_id })),
            )
                .into_response()
        }
    }
}
