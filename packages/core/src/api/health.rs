use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::AppState;

/// `GET /health`: liveness plus the state of this process's scheduler.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (scheduler_status, scheduled_jobs) = match &state.scheduler {
        Some(scheduler) => {
            let status = scheduler.status();
            let label = if status.running { "running" } else { "stopped" };
            (label, status.jobs_count)
        }
        None => ("unavailable", 0),
    };

    (
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(json!({
            "status": "ok",
            "scheduler_status": scheduler_status,
            "scheduled_jobs": scheduled_jobs,
        })),
    )
}

/// `GET /telemetry`: Prometheus text exposition.
pub async fn telemetry(State(state): State<AppState>) -> Response {
    match state.telemetry.render() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(body))
            .expect("telemetry response should be valid"),
        Err(e) => {
            tracing::error!(error = %e, "failed to render telemetry");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("telemetry error"))
                .expect("telemetry error response should be valid")
        }
    }
}
