//! Buffered reading of `multipart/form-data` uploads.

use crate::errors::AppError;
use axum::extract::{
    Multipart,
    multipart::{MultipartError, MultipartRejection},
};
use bytes::Bytes;
use std::collections::HashMap;

/// Name of the form field carrying the uploaded file.
pub const FILE_FIELD: &str = "file";

#[derive(Debug)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Bytes,
}

/// A parsed form: the `file` part (if any) plus every plain text field.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub file: Option<UploadedFile>,
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    /// Read the whole form. A request that is not multipart at all reads as
    /// an empty form, so callers report it as a missing file.
    pub async fn read(multipart: Result<Multipart, MultipartRejection>) -> Result<Self, AppError> {
        let mut form = UploadForm::default();
        let Ok(mut multipart) = multipart else {
            return Ok(form);
        };

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == FILE_FIELD {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                tracing::debug!("received upload `{}` ({} bytes)", file_name, bytes.len());
                form.file = Some(UploadedFile { file_name, bytes });
            } else if field.file_name().is_none() {
                let text = field.text().await.map_err(multipart_error)?;
                form.fields.insert(name, text);
            }
        }
        Ok(form)
    }

    /// The uploaded file, mapping absence and blank names to 400s.
    pub fn require_file(self) -> Result<(UploadedFile, HashMap<String, String>), AppError> {
        let file = self
            .file
            .ok_or_else(|| AppError::bad_request("No file provided"))?;
        if file.file_name.trim().is_empty() {
            return Err(AppError::bad_request("No file selected"));
        }
        Ok((file, self.fields))
    }
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}
