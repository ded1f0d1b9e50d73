//! Verifier: runs verification jobs in the background.
//!
//! A job lists the spreadsheets the uploaded service account can see,
//! downloads the first one, parses it and publishes a sample. Every step is
//! written to the [`JobRegistry`] (structured state) and to the job log
//! (text). Whatever happens, the job ends in a terminal state: failures are
//! converted into `error`, parse failures into `partial`.

use crate::{
    models::{
        drive_file::{FileSummary, SpreadsheetKind},
        job::{JobState, VerificationResult},
    },
    services::{
        credential_store::{CredentialError, CredentialStore},
        drive_client::{DriveApi, DriveError},
        job_artifacts::{ArtifactError, JobArtifacts},
        job_registry::{INTERRUPTED_MESSAGE, JobError, JobRegistry},
        tabular::{self, SAMPLE_ROWS, TableFormat},
    },
};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info, warn};

pub const NO_CREDENTIAL_MESSAGE: &str = "No service account configured";
pub const NO_FILES_MESSAGE: &str = "No Google Sheets found accessible by this service account.";
pub const SUCCESS_MESSAGE: &str = "Verification successful!";
pub const PARSE_FAILED_MESSAGE: &str = "File downloaded but could not be parsed.";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
    #[error("internal error: {0}")]
    Internal(String),
}

pub type VerifyResult<T> = Result<T, VerifyError>;

/// Bounds applied to every job.
#[derive(Clone, Copy, Debug)]
pub struct WorkerLimits {
    /// Maximum number of files requested from the listing.
    pub page_size: usize,
    /// Jobs allowed to run at once; the rest wait as `pending`.
    pub max_concurrent_jobs: usize,
    /// Deadline for each network step.
    pub step_timeout: Duration,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_concurrent_jobs: 4,
            step_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct Verifier {
    registry: JobRegistry,
    credentials: CredentialStore,
    artifacts: JobArtifacts,
    drive: Arc<dyn DriveApi>,
    permits: Arc<Semaphore>,
    limits: WorkerLimits,
}

impl Verifier {
    pub fn new(
        registry: JobRegistry,
        credentials: CredentialStore,
        artifacts: JobArtifacts,
        drive: Arc<dyn DriveApi>,
        limits: WorkerLimits,
    ) -> Self {
        Self {
            registry,
            credentials,
            artifacts,
            drive,
            permits: Arc::new(Semaphore::new(limits.max_concurrent_jobs.max(1))),
            limits,
        }
    }

    /// Run `job_id` on the runtime without waiting for it.
    ///
    /// The job must already exist in the registry. A panic inside the job
    /// is caught here and recorded as a terminal error.
    pub fn spawn(&self, job_id: String) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let _permit = match this.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    this.finish(&job_id, JobState::failed("worker pool is shut down"))
                        .await;
                    return;
                }
            };

            let worker = this.clone();
            let id = job_id.clone();
            if let Err(err) = tokio::spawn(async move { worker.run(&id).await }).await {
                error!(job_id = %job_id, "verification worker crashed: {}", err);
                this.finish(&job_id, JobState::failed(format!("worker crashed: {}", err)))
                    .await;
            }
        })
    }

    /// Fail every job a previous process left unfinished and mirror the new
    /// state into each job directory. Returns how many jobs were failed.
    pub async fn fail_interrupted(&self) -> VerifyResult<usize> {
        let ids = self.registry.fail_interrupted().await?;
        let state = JobState::failed(INTERRUPTED_MESSAGE);
        for id in &ids {
            warn!(job_id = %id, "job was interrupted by a restart");
            self.record_artifacts(id, &state).await;
        }
        Ok(ids.len())
    }

    /// Run the job to completion and return the terminal state it published.
    pub async fn run(&self, job_id: &str) -> JobState {
        info!(job_id = %job_id, "verification started");
        let state = match self.verify(job_id).await {
            Ok(state) => state,
            Err(err) => {
                warn!(job_id = %job_id, "verification failed: {}", err);
                JobState::failed(err.to_string())
            }
        };
        self.finish(job_id, state.clone()).await;
        state
    }

    async fn verify(&self, job_id: &str) -> VerifyResult<JobState> {
        self.publish(job_id, JobState::running("Loading credentials..."))
            .await?;
        let Some(account) = self.credentials.load().await? else {
            return Ok(JobState::failed(NO_CREDENTIAL_MESSAGE));
        };

        self.publish(job_id, JobState::running("Listing files...")).await?;
        let listed = self
            .deadline(
                "listing files",
                self.drive
                    .list_spreadsheets(&account, self.limits.page_size),
            )
            .await??;
        self.artifacts.write_files(job_id, &listed).await?;

        let sheets: Vec<&FileSummary> = listed
            .iter()
            .filter(|f| f.spreadsheet_kind().is_some())
            .collect();
        let Some(target) = sheets.first().copied() else {
            return Ok(JobState::completed(VerificationResult {
                files_found: 0,
                message: NO_FILES_MESSAGE.into(),
                ..Default::default()
            }));
        };

        self.publish(
            job_id,
            JobState::running(format!(
                "Found {} file(s). Exporting \"{}\"...",
                sheets.len(),
                target.name
            )),
        )
        .await?;
        let content = self
            .deadline("exporting file", self.drive.download(&account, target))
            .await??;

        self.publish(
            job_id,
            JobState::running(format!("Parsing {} bytes...", content.len())),
        )
        .await?;
        let format = match target.spreadsheet_kind() {
            Some(SpreadsheetKind::Csv) => TableFormat::Csv,
            _ => TableFormat::Workbook,
        };
        let parsed =
            tokio::task::spawn_blocking(move || tabular::parse_table(&content, format, None))
                .await
                .map_err(|err| VerifyError::Internal(err.to_string()))?;

        let mut result = VerificationResult {
            files_found: sheets.len(),
            exported_file: Some(target.name.clone()),
            file_id: Some(target.id.clone()),
            mime_type: Some(target.mime_type.clone()),
            ..Default::default()
        };

        match parsed {
            Ok(table) => {
                let sample = table.sample(SAMPLE_ROWS);
                self.artifacts.write_sample(job_id, &sample).await?;
                result.columns = table.columns;
                result.row_count = Some(table.rows.len());
                result.sample_data = sample;
                result.message = SUCCESS_MESSAGE.into();
                Ok(JobState::completed(result))
            }
            Err(err) => {
                warn!(job_id = %job_id, file = %target.name, "parse failed: {}", err);
                result.message = PARSE_FAILED_MESSAGE.into();
                Ok(JobState::partial(result, err.to_string()))
            }
        }
    }

    /// Publish a non-terminal state. Failing to record it aborts the job.
    async fn publish(&self, job_id: &str, state: JobState) -> VerifyResult<()> {
        info!(job_id = %job_id, status = state.status.as_str(), "{}", state.summary());
        self.registry.set(job_id, &state).await?;
        self.record_artifacts(job_id, &state).await;
        Ok(())
    }

    /// Publish the terminal state; errors can only be logged at this point.
    async fn finish(&self, job_id: &str, state: JobState) {
        info!(job_id = %job_id, status = state.status.as_str(), "verification finished");
        if let Err(err) = self.registry.set(job_id, &state).await {
            error!(job_id = %job_id, "failed to record final state: {}", err);
            return;
        }
        self.record_artifacts(job_id, &state).await;
    }

    /// Mirror a state into the job directory. Best effort.
    async fn record_artifacts(&self, job_id: &str, state: &JobState) {
        if let Err(err) = self.artifacts.append_log(job_id, &state.summary()).await {
            warn!(job_id = %job_id, "failed to append job log: {}", err);
        }
        if let Err(err) = self.artifacts.write_status(job_id, state).await {
            warn!(job_id = %job_id, "failed to write status document: {}", err);
        }
    }

    async fn deadline<F: Future>(&self, step: &'static str, fut: F) -> VerifyResult<F::Output> {
        tokio::time::timeout(self.limits.step_timeout, fut)
            .await
            .map_err(|_| VerifyError::Timeout {
                step,
                after: self.limits.step_timeout,
            })
    }
}
