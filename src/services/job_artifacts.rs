//! Per-job artifacts on disk, beneath `root/{job_id}/`:
//!
//! - `status.json`  last state the worker published
//! - `log.txt`  append-only, one timestamped line per step
//! - `files.json`  listing snapshot taken by the worker
//! - `sample.json`  sample rows of a successful parse
//!
//! Each worker only writes inside its own job directory. JSON documents are
//! replaced through a temp file + rename so readers never see half a file.

use crate::models::{drive_file::FileSummary, job::JobState};
use chrono::{SecondsFormat, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use uuid::Uuid;

const STATUS_FILE: &str = "status.json";
const LOG_FILE: &str = "log.txt";
const FILES_FILE: &str = "files.json";
const SAMPLE_FILE: &str = "sample.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{artifact} for job `{job_id}` not found")]
    NotFound {
        job_id: String,
        artifact: &'static str,
    },
    #[error("malformed {artifact}: {source}")]
    Json {
        artifact: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[derive(Clone, Debug)]
pub struct JobArtifacts {
    root: PathBuf,
}

impl JobArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of one job. Ids that are not UUIDs never map to a path.
    fn job_dir(&self, job_id: &str, artifact: &'static str) -> ArtifactResult<PathBuf> {
        if Uuid::parse_str(job_id).is_err() {
            return Err(ArtifactError::NotFound {
                job_id: job_id.to_string(),
                artifact,
            });
        }
        Ok(self.root.join(job_id))
    }

    /// Append one `timestamp  message` line to the job log.
    pub async fn append_log(&self, job_id: &str, message: &str) -> ArtifactResult<()> {
        let dir = self.job_dir(job_id, LOG_FILE)?;
        fs::create_dir_all(&dir).await?;

        let line = format!(
            "{}  {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message.replace('\n', " ")
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn write_status(&self, job_id: &str, state: &JobState) -> ArtifactResult<()> {
        self.write_json(job_id, STATUS_FILE, state).await
    }

    pub async fn write_files(&self, job_id: &str, files: &[FileSummary]) -> ArtifactResult<()> {
        self.write_json(job_id, FILES_FILE, &files).await
    }

    pub async fn write_sample(
        &self,
        job_id: &str,
        sample: &[Map<String, Value>],
    ) -> ArtifactResult<()> {
        self.write_json(job_id, SAMPLE_FILE, &sample).await
    }

    /// Open the log for streaming out.
    pub async fn open_log(&self, job_id: &str) -> ArtifactResult<File> {
        let path = self.job_dir(job_id, LOG_FILE)?.join(LOG_FILE);
        File::open(&path)
            .await
            .map_err(|err| not_found_or_io(err, job_id, LOG_FILE))
    }

    pub async fn read_files(&self, job_id: &str) -> ArtifactResult<Vec<FileSummary>> {
        self.read_json(job_id, FILES_FILE).await
    }

    pub async fn read_sample(&self, job_id: &str) -> ArtifactResult<Vec<Map<String, Value>>> {
        self.read_json(job_id, SAMPLE_FILE).await
    }

    async fn write_json<T: Serialize + ?Sized>(
        &self,
        job_id: &str,
        artifact: &'static str,
        value: &T,
    ) -> ArtifactResult<()> {
        let dir = self.job_dir(job_id, artifact)?;
        fs::create_dir_all(&dir).await?;
        let encoded = serde_json::to_vec_pretty(value)
            .map_err(|source| ArtifactError::Json { artifact, source })?;
        write_atomic(&dir, &dir.join(artifact), &encoded).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        job_id: &str,
        artifact: &'static str,
    ) -> ArtifactResult<T> {
        let path = self.job_dir(job_id, artifact)?.join(artifact);
        let raw = fs::read(&path)
            .await
            .map_err(|err| not_found_or_io(err, job_id, artifact))?;
        serde_json::from_slice(&raw).map_err(|source| ArtifactError::Json { artifact, source })
    }
}

async fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, target).await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

fn not_found_or_io(err: io::Error, job_id: &str, artifact: &'static str) -> ArtifactError {
    if err.kind() == ErrorKind::NotFound {
        ArtifactError::NotFound {
            job_id: job_id.to_string(),
            artifact,
        }
    } else {
        ArtifactError::Io(err)
    }
}
