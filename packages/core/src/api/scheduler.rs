//! Scheduler job management endpoints.
//!
//! Only the process holding the scheduler lock runs a scheduler; every
//! route here answers 503 elsewhere.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use super::{error_response, ApiError, AppState};
use crate::metrics::MetricsError;
use crate::scheduler::{FireOutcome, JobInfo, JobSpec, MetricScheduler, SchedulerStatus};

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<JobInfo>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub job_id: String,
    pub outcome: FireOutcome,
}

fn scheduler(state: &AppState) -> Result<&MetricScheduler, ApiError> {
    state
        .scheduler
        .as_ref()
        .ok_or_else(|| error_response(MetricsError::SchedulerUnavailable))
}

pub async fn add_job(
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<JobInfo>), ApiError> {
    let scheduler = scheduler(&state)?;
    if let Some(entity) = spec.entity.as_deref() {
        state
            .service
            .repository()
            .registry()
            .ensure_known(entity)
            .map_err(error_response)?;
    }
    let info = scheduler.add_job(spec).map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<JobList>, ApiError> {
    let jobs = scheduler(&state)?.list_jobs();
    Ok(Json(JobList { jobs }))
}

pub async fn remove_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    scheduler(&state)?.remove_job(&id).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let outcome = scheduler(&state)?.run_job_now(&id).map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(RunResponse { job_id: id, outcome })))
}

pub async fn status(State(state): State<AppState>) -> Result<Json<SchedulerStatus>, ApiError> {
    Ok(Json(scheduler(&state)?.status()))
}
