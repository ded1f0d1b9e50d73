//! CredentialStore: holds the single service-account key of the process.
//!
//! The key is persisted as JSON at one fixed path and replaced atomically on
//! every successful upload, so it survives restarts and is read by the
//! handlers and the workers through the same file. Invalid uploads are
//! rejected before anything is written.

use crate::models::credential::{REQUIRED_FIELDS, SERVICE_ACCOUNT_TYPE, ServiceAccount};
use serde_json::Value;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid JSON file")]
    InvalidFormat { detail: String },
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid service account type")]
    WrongType(String),
    #[error("stored credential is unreadable: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CredentialError {
    /// True for errors caused by the uploaded document itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CredentialError::InvalidFormat { .. }
                | CredentialError::MissingField(_)
                | CredentialError::WrongType(_)
        )
    }
}

pub type CredentialResult<T> = Result<T, CredentialError>;

#[derive(Clone, Debug)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store the key at `path`; the parent directory is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Validate raw upload bytes without touching storage.
    ///
    /// Checks run in a fixed order: JSON object, presence of every
    /// [`REQUIRED_FIELDS`] entry, type marker, then typed decode.
    pub fn validate(raw: &[u8]) -> CredentialResult<ServiceAccount> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|err| CredentialError::InvalidFormat {
                detail: err.to_string(),
            })?;
        let Some(object) = value.as_object() else {
            return Err(CredentialError::InvalidFormat {
                detail: "top-level value is not an object".into(),
            });
        };

        for field in REQUIRED_FIELDS {
            if !object.contains_key(field) {
                return Err(CredentialError::MissingField(field));
            }
        }

        match object.get("type").and_then(Value::as_str) {
            Some(SERVICE_ACCOUNT_TYPE) => {}
            other => {
                return Err(CredentialError::WrongType(
                    other.map(str::to_string).unwrap_or_default(),
                ));
            }
        }

        serde_json::from_value(value).map_err(|err| CredentialError::InvalidFormat {
            detail: err.to_string(),
        })
    }

    /// Validate and persist an uploaded key, replacing any previous one.
    pub async fn save(&self, raw: &[u8]) -> CredentialResult<ServiceAccount> {
        let account = Self::validate(raw)?;
        let encoded = serde_json::to_vec_pretty(&account).map_err(io::Error::other)?;

        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&encoded).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &self.path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CredentialError::Io(err));
        }

        info!(
            client_email = %account.client_email,
            project_id = %account.project_id,
            "stored service account credential"
        );
        Ok(account)
    }

    /// Return the most recently saved key, or `None` if nothing was saved.
    pub async fn load(&self) -> CredentialResult<Option<ServiceAccount>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no credential at {}", self.path.display());
                return Ok(None);
            }
            Err(err) => return Err(CredentialError::Io(err)),
        };

        Self::validate(&raw)
            .map(Some)
            .map_err(|err| CredentialError::Corrupted(err.to_string()))
    }
}
