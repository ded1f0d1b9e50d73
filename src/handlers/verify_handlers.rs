//! Verification job endpoints: start a job, then poll its state and
//! artifacts.

use crate::{
    errors::AppError,
    handlers::credential_handlers::require_account,
    models::{drive_file::FileSummary, job::JobState},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::io::ReaderStream;

#[derive(Debug, Serialize)]
pub struct StartVerifyResponse {
    pub job_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Serialize)]
pub struct JobFilesResponse {
    pub job_id: String,
    pub count: usize,
    pub files: Vec<FileSummary>,
}

#[derive(Debug, Serialize)]
pub struct JobSampleResponse {
    pub job_id: String,
    pub sample_data: Vec<Map<String, Value>>,
}

/// `POST /start-verify`: create a job and hand it to a background worker.
///
/// Returns as soon as the job is registered; the id is pollable right away.
pub async fn start_verify(
    State(state): State<AppState>,
) -> Result<Json<StartVerifyResponse>, AppError> {
    require_account(&state).await?;

    let job_id = state.registry.create().await?;
    if let Err(err) = state.artifacts.append_log(&job_id, "[pending] Job created").await {
        tracing::warn!(job_id = %job_id, "failed to start job log: {}", err);
    }
    state.verifier.spawn(job_id.clone());
    tracing::info!(job_id = %job_id, "verification job started");

    Ok(Json(StartVerifyResponse {
        job_id,
        status: "started",
    }))
}

/// `GET /verify-status/{id}`
pub async fn verify_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let job = state
        .registry
        .get(&job_id)
        .await?
        .ok_or_else(|| AppError::not_found("Job not found"))?;
    Ok(Json(JobStatusResponse { job_id, state: job }))
}

/// `GET /verify-log/{id}`: stream the job's text log.
pub async fn verify_log(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let file = state.artifacts.open_log(&job_id).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(response)
}

/// `GET /verify-files/{id}`: listing snapshot taken by the worker.
pub async fn verify_files(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobFilesResponse>, AppError> {
    let files = state.artifacts.read_files(&job_id).await?;
    Ok(Json(JobFilesResponse {
        job_id,
        count: files.len(),
        files,
    }))
}

/// `GET /verify-sample/{id}`: sample rows of a successful parse.
pub async fn verify_sample(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSampleResponse>, AppError> {
    let sample_data = state.artifacts.read_sample(&job_id).await?;
    Ok(Json(JobSampleResponse {
        job_id,
        sample_data,
    }))
}
