//! Metric definition endpoints.
//!
//! Routes:
//! - `POST   /metrics`                        create one definition
//! - `POST   /metrics/bulk`                   create many, reporting failures per item
//! - `GET    /metrics`                        list with entity/type filters and paging
//! - `GET    /metrics/statistics`             counts per type and entity
//! - `GET    /metrics/:identifier`            fetch by id or name
//! - `PUT    /metrics/:identifier`            partial update, `?recalculate=true` to refresh;
//!                                            a missing name with a `type` is created
//! - `DELETE /metrics/:identifier`            remove
//! - `POST   /metrics/:identifier/calculate`  calculate and store one metric
//! - `POST   /metrics/calculate/all`          recalculate all, or one entity's
//! - `POST   /metrics/calculate/batch`        recalculate a list of identifiers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{error_response, ApiError, AppState};
use crate::metrics::{
    BatchFailure, BatchReport, ListQuery, MetricDefinition, MetricRef, MetricStatistics,
    MetricUpdate, NewMetric,
};

#[derive(Debug, Deserialize)]
pub struct EntityQuery {
    pub entity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuery {
    #[serde(default)]
    pub recalculate: bool,
}

#[derive(Debug, Serialize)]
pub struct BulkCreateResponse {
    pub created: Vec<MetricDefinition>,
    pub failed: Vec<BatchFailure>,
}

/// Batch calculation summary.
#[derive(Debug, Serialize)]
pub struct CalculationResponse {
    pub calculated: usize,
    pub errors: usize,
    pub results: Vec<MetricDefinition>,
    pub error_details: Vec<BatchFailure>,
}

impl From<BatchReport> for CalculationResponse {
    fn from(report: BatchReport) -> Self {
        Self {
            calculated: report.updated_count(),
            errors: report.failed_count(),
            results: report.updated,
            error_details: report.failed,
        }
    }
}

pub async fn create_metric(
    State(state): State<AppState>,
    Json(body): Json<NewMetric>,
) -> Result<(StatusCode, Json<MetricDefinition>), ApiError> {
    let created = state.service.repository().add(&body).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn bulk_create_metrics(
    State(state): State<AppState>,
    Json(body): Json<Vec<NewMetric>>,
) -> Json<BulkCreateResponse> {
    let report = state.service.bulk_create(&body).await;
    Json(BulkCreateResponse {
        created: report.updated,
        failed: report.failed,
    })
}

pub async fn list_metrics(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<MetricDefinition>>, ApiError> {
    let metrics = state.service.repository().list(&query).await.map_err(error_response)?;
    Ok(Json(metrics))
}

pub async fn metric_statistics(
    State(state): State<AppState>,
    Query(query): Query<EntityQuery>,
) -> Result<Json<MetricStatistics>, ApiError> {
    let stats = state
        .service
        .repository()
        .statistics(query.entity.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(stats))
}

pub async fn get_metric(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Json<MetricDefinition>, ApiError> {
    let metric = state
        .service
        .repository()
        .get(&MetricRef::parse(&identifier))
        .await
        .map_err(error_response)?;
    Ok(Json(metric))
}

pub async fn update_metric(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<UpdateQuery>,
    Json(body): Json<MetricUpdate>,
) -> Result<Json<MetricDefinition>, ApiError> {
    let updated = state
        .service
        .update_metric(&MetricRef::parse(&identifier), &body, query.recalculate)
        .await
        .map_err(error_response)?;
    Ok(Json(updated))
}

pub async fn delete_metric(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .repository()
        .delete(&MetricRef::parse(&identifier))
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn calculate_metric(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Json<MetricDefinition>, ApiError> {
    let metric = state
        .service
        .calculate_metric(&MetricRef::parse(&identifier))
        .await
        .map_err(error_response)?;
    Ok(Json(metric))
}

pub async fn calculate_all_metrics(
    State(state): State<AppState>,
    Query(query): Query<EntityQuery>,
) -> Result<Json<CalculationResponse>, ApiError> {
    let report = state
        .service
        .calculate_all_metrics(query.entity.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(report.into()))
}

pub async fn calculate_batch(
    State(state): State<AppState>,
    Json(identifiers): Json<Vec<String>>,
) -> Json<CalculationResponse> {
    Json(state.service.calculate_batch(&identifiers).await.into())
}
