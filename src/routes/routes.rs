//! Defines routes for credential upload, Drive listing and verification jobs.
//!
//! ## Structure
//! - **Service endpoints** (root only)
//!   - `GET  /`  service banner
//!   - `GET  /healthz`  liveness
//!   - `GET  /readyz`  readiness (SQLite + disk)
//!
//! - **API endpoints** (mounted at the root and again under `/api`)
//!   - `POST /upload-sa`  store a service-account key
//!   - `GET  /files`  list visible spreadsheets
//!   - `POST /start-verify`  start a background verification job
//!   - `GET  /verify-status/{id}`  poll job state
//!   - `GET  /verify-log/{id}`  job log as text
//!   - `GET  /verify-files/{id}`  listing snapshot of the job
//!   - `GET  /verify-sample/{id}`  sample rows of the job
//!   - `POST /preview`  parse an uploaded spreadsheet in place
//!   - `POST /preview-sheet`  load a Google Sheet by URL or id

use crate::{
    handlers::{
        credential_handlers::{list_files, upload_service_account},
        health_handlers::{healthz, index, readyz},
        preview_handlers::{preview, preview_sheet},
        verify_handlers::{start_verify, verify_files, verify_log, verify_sample, verify_status},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Largest spreadsheet accepted by `/preview`.
const PREVIEW_BODY_LIMIT: usize = 25 * 1024 * 1024;

/// Build and return the router for every endpoint.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(api_routes())
        .nest("/api", api_routes())
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/upload-sa", post(upload_service_account))
        .route("/files", get(list_files))
        .route("/start-verify", post(start_verify))
        .route("/verify-status/{id}", get(verify_status))
        .route("/verify-log/{id}", get(verify_log))
        .route("/verify-files/{id}", get(verify_files))
        .route("/verify-sample/{id}", get(verify_sample))
        .route(
            "/preview",
            post(preview).layer(DefaultBodyLimit::max(PREVIEW_BODY_LIMIT)),
        )
        .route("/preview-sheet", post(preview_sheet))
}
