//! Shared state handed to every handler.

use crate::services::{
    credential_store::CredentialStore, drive_client::DriveApi, job_artifacts::JobArtifacts,
    job_registry::JobRegistry, verifier::Verifier,
};
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
    pub credentials: CredentialStore,
    pub registry: JobRegistry,
    pub artifacts: JobArtifacts,
    pub drive: Arc<dyn DriveApi>,
    pub verifier: Verifier,
    /// Root of the credential file and job directories; probed by `/readyz`.
    pub data_dir: PathBuf,
    pub page_size: usize,
    pub request_timeout: Duration,
}
