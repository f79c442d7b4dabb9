//! HTTP adapter over the metric service and the scheduler.
//!
//! Every handler reports failures as `(StatusCode, Json)` with a body of
//! `{"error": <kind>, "message": <text>}`.

pub mod health;
pub mod metrics;
pub mod scheduler;

use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::metrics::{MetricService, MetricsError};
use crate::scheduler::MetricScheduler;
use crate::telemetry::AppMetrics;

/// Shared state for all routes. `scheduler` is `None` in processes that
/// did not win the scheduler lock.
#[derive(Clone)]
pub struct AppState {
    pub service: MetricService,
    pub scheduler: Option<MetricScheduler>,
    pub telemetry: Arc<AppMetrics>,
}

pub type ApiError = (StatusCode, Json<Value>);

pub fn status_for(err: &MetricsError) -> StatusCode {
    match err {
        MetricsError::NotFound { .. } => StatusCode::NOT_FOUND,
        MetricsError::DuplicateName { .. } => StatusCode::CONFLICT,
        MetricsError::SchedulerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        MetricsError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Convert a domain error into the JSON error response.
pub fn error_response(err: MetricsError) -> ApiError {
    if let MetricsError::Storage(e) = &err {
        tracing::error!(error = %e, "storage failure while handling request");
    }
    (
        status_for(&err),
        Json(json!({ "error": err.kind(), "message": err.public_message() })),
    )
}

/// Build the complete router. `cors` is applied to every route.
pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/telemetry", get(health::telemetry))
        .route(
            "/metrics",
            post(metrics::create_metric).get(metrics::list_metrics),
        )
        .route("/metrics/bulk", post(metrics::bulk_create_metrics))
        .route("/metrics/statistics", get(metrics::metric_statistics))
        .route("/metrics/calculate/all", post(metrics::calculate_all_metrics))
        .route("/metrics/calculate/batch", post(metrics::calculate_batch))
        .route(
            "/metrics/:identifier",
            get(metrics::get_metric)
                .put(metrics::update_metric)
                .delete(metrics::delete_metric),
        )
        .route("/metrics/:identifier/calculate", post(metrics::calculate_metric))
        .route(
            "/scheduler/jobs",
            post(scheduler::add_job).get(scheduler::list_jobs),
        )
        .route("/scheduler/jobs/:id", axum::routing::delete(scheduler::remove_job))
        .route("/scheduler/jobs/:id/run", post(scheduler::run_job))
        .route("/scheduler/status", get(scheduler::status))
        .with_state(state)
        .layer(cors)
}

/// CORS for the configured origins. Origins that are not valid header
/// values are skipped with a warning.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(status_for(&MetricsError::not_found("Metric 1")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&MetricsError::DuplicateName { name: "x".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&MetricsError::SchedulerUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&MetricsError::Storage(sqlx::Error::PoolTimedOut)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&MetricsError::invalid_filter("bad")),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn storage_errors_hide_their_details() {
        let (status, Json(body)) = error_response(MetricsError::Storage(sqlx::Error::PoolTimedOut));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Storage");
        assert_eq!(body["message"], "storage failure");
    }
}
