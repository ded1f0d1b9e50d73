//! Service-account upload and Drive listing.

use crate::{
    errors::AppError,
    handlers::upload_form::UploadForm,
    models::{credential::ServiceAccount, drive_file::FileSummary},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
};
use serde::Serialize;

pub const NO_SERVICE_ACCOUNT: &str = "No service account uploaded";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: &'static str,
    pub client_email: String,
    pub project_id: String,
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub files: Vec<FileSummary>,
    pub count: usize,
}

/// `POST /upload-sa`: store a service-account key from the `file` field.
pub async fn upload_service_account(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let (file, _) = UploadForm::read(multipart).await?.require_file()?;
    let account = state.credentials.save(&file.bytes).await?;

    Ok(Json(UploadResponse {
        success: true,
        message: "Service account uploaded successfully",
        client_email: account.client_email,
        project_id: account.project_id,
    }))
}

/// `GET /files`: spreadsheets visible to the stored service account.
pub async fn list_files(State(state): State<AppState>) -> Result<Json<FilesResponse>, AppError> {
    let account = require_account(&state).await?;
    let files = tokio::time::timeout(
        state.request_timeout,
        state.drive.list_spreadsheets(&account, state.page_size),
    )
    .await
    .map_err(|_| AppError::internal("listing files timed out"))??;

    Ok(Json(FilesResponse {
        count: files.len(),
        files,
    }))
}

/// Load the stored key or answer 400 when none was uploaded yet.
pub async fn require_account(state: &AppState) -> Result<ServiceAccount, AppError> {
    state
        .credentials
        .load()
        .await?
        .ok_or_else(|| AppError::bad_request(NO_SERVICE_ACCOUNT))
}
