use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::models::{ApiResponse, Job, ModelInfo};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:instance/ml/model-info", get(get_model_info))
        .route("/:instance/ml/recalculate", post(start_recalculation))
        .route("/:instance/ml/jobs", get(list_active_jobs))
        .route(
            "/:instance/ml/job-status/:job_id",
            get(get_job_status).delete(cancel_job),
        )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationStarted {
    pub job_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub status: String,
    pub message: String,
}

fn validate_instance(state: &AppState, instance: &str) -> Result<(), AppError> {
    if state.is_instance_available(instance) {
        Ok(())
    } else {
        warn!("🔍 Unknown database instance: {}", instance);
        Err(AppError::NotFound)
    }
}

/// GET /api/:instance/ml/model-info
pub async fn get_model_info(
    Path(instance): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ModelInfo>>, AppError> {
    let started = Instant::now();
    validate_instance(&state, &instance)?;

    let info = state
        .recalculation
        .model_info()
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(ApiResponse::success(info).with_execution_time(started)))
}

/// POST /api/:instance/ml/recalculate
///
/// Starts a recalculation in the background and answers 202 with the job id
/// to poll.
pub async fn start_recalculation(
    Path(instance): Path<String>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<RecalculationStarted>>), AppError> {
    let started = Instant::now();
    validate_instance(&state, &instance)?;

    let job_id = state.recalculation.start_recalculation();
    info!("POST /api/{}/ml/recalculate - started job {}", instance, job_id);

    let body = RecalculationStarted {
        job_id,
        status: "started".to_string(),
        message: "ML recalculation started successfully".to_string(),
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(body).with_execution_time(started)),
    ))
}

/// GET /api/:instance/ml/job-status/:job_id
pub async fn get_job_status(
    Path((instance, job_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Job>>, AppError> {
    let started = Instant::now();
    validate_instance(&state, &instance)?;

    let job = state
        .job_tracker
        .get_status(&job_id)
        .ok_or(AppError::NotFound)?;

    Ok(Json(ApiResponse::success(job).with_execution_time(started)))
}

/// DELETE /api/:instance/ml/job-status/:job_id
///
/// Always 200; the body says whether the cancellation was accepted.
pub async fn cancel_job(
    Path((instance, job_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CancelJobResponse>>, AppError> {
    let started = Instant::now();
    validate_instance(&state, &instance)?;

    let body = if state.job_tracker.cancel_job(&job_id) {
        CancelJobResponse {
            status: "cancelled".to_string(),
            message: "Job cancelled successfully".to_string(),
        }
    } else {
        CancelJobResponse {
            status: "not_found_or_completed".to_string(),
            message: "Job not found or already completed".to_string(),
        }
    };

    Ok(Json(ApiResponse::success(body).with_execution_time(started)))
}

/// GET /api/:instance/ml/jobs
pub async fn list_active_jobs(
    Path(instance): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Job>>>, AppError> {
    let started = Instant::now();
    validate_instance(&state, &instance)?;

    let jobs = state.job_tracker.active_jobs();
    Ok(Json(ApiResponse::success(jobs).with_execution_time(started)))
}
