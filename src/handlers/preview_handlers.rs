//! Spreadsheet preview outside of verification jobs.
//!
//! `/preview` parses an uploaded workbook or CSV in place, without a service
//! account. `/preview-sheet` loads a Google Sheet by URL or id with the stored
//! key. Both accept the same options: a worksheet name, a case-insensitive
//! `contains` filter on one `column`, and `format=csv` to download the
//! (filtered) table instead of a JSON sample.

use crate::{
    errors::AppError,
    handlers::{
        credential_handlers::require_account,
        upload_form::{UploadForm, UploadedFile},
    },
    models::drive_file::{FileSummary, spreadsheet_id},
    services::tabular::{self, SAMPLE_ROWS, Table, TableFormat},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// File name offered for CSV downloads.
pub const EXPORT_FILE_NAME: &str = "export.csv";

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub file_name: String,
    pub sheet: Option<String>,
    pub columns: Vec<String>,
    pub row_count: usize,
    /// Rows before filtering; only present when a filter was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<usize>,
    pub sample_data: Vec<Map<String, Value>>,
}

/// Options shared by both preview endpoints. Blank values count as absent.
#[derive(Debug, Default, Deserialize)]
pub struct PreviewOptions {
    pub sheet: Option<String>,
    pub column: Option<String>,
    pub contains: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SheetPreviewRequest {
    /// Full `docs.google.com` URL or the bare spreadsheet id.
    pub id_or_url: String,
    #[serde(flatten)]
    pub options: PreviewOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Csv,
}

impl PreviewOptions {
    fn from_fields(fields: &HashMap<String, String>) -> Self {
        let get = |key: &str| fields.get(key).cloned();
        Self {
            sheet: get("sheet"),
            column: get("column"),
            contains: get("contains"),
            format: get("format"),
        }
        .normalized()
    }

    fn normalized(self) -> Self {
        let clean = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            sheet: clean(self.sheet),
            column: clean(self.column),
            contains: clean(self.contains),
            format: clean(self.format),
        }
    }

    fn output_format(&self) -> Result<OutputFormat, AppError> {
        match self.format.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("json") => Ok(OutputFormat::Json),
            Some("csv") => Ok(OutputFormat::Csv),
            Some(other) => Err(AppError::bad_request(format!(
                "Unsupported format `{}`, expected json or csv",
                other
            ))),
        }
    }
}

/// `POST /preview`: multipart `file` plus optional `sheet`, `column`,
/// `contains` and `format` fields.
pub async fn preview(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let (UploadedFile { file_name, bytes }, fields) =
        UploadForm::read(multipart).await?.require_file()?;
    let format = TableFormat::from_file_name(&file_name).ok_or_else(|| {
        AppError::bad_request("Unsupported file type, expected .xlsx, .xls, .ods or .csv")
    })?;
    let options = PreviewOptions::from_fields(&fields);
    let output = options.output_format()?;

    let table = parse(bytes, format, options.sheet.clone()).await?;
    render(file_name, options, output, table)
}

/// `POST /preview-sheet`: JSON `{"id_or_url", "sheet"?, "column"?,
/// "contains"?, "format"?}`. The first worksheet is used unless `sheet`
/// names another one.
pub async fn preview_sheet(
    State(state): State<AppState>,
    body: Result<Json<SheetPreviewRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let id = spreadsheet_id(&request.id_or_url)
        .ok_or_else(|| AppError::bad_request("Invalid Google Sheet URL or ID"))?
        .to_string();
    let options = request.options.normalized();
    let output = options.output_format()?;
    let account = require_account(&state).await?;

    let bytes = tokio::time::timeout(
        state.request_timeout,
        state.drive.download(&account, &FileSummary::google_sheet(&id)),
    )
    .await
    .map_err(|_| AppError::internal("exporting sheet timed out"))??;
    tracing::debug!(sheet_id = %id, size = bytes.len(), "exported sheet for preview");

    let table = parse(bytes, TableFormat::Workbook, options.sheet.clone()).await?;
    render(id, options, output, table)
}

async fn parse(bytes: Bytes, format: TableFormat, sheet: Option<String>) -> Result<Table, AppError> {
    let table =
        tokio::task::spawn_blocking(move || tabular::parse_table(&bytes, format, sheet.as_deref()))
            .await
            .map_err(|err| AppError::internal(err.to_string()))??;
    Ok(table)
}

fn render(
    file_name: String,
    options: PreviewOptions,
    output: OutputFormat,
    table: Table,
) -> Result<Response, AppError> {
    let total_rows = table.row_count();
    let (table, filtered) = match (&options.column, &options.contains) {
        (Some(column), Some(needle)) => (table.filter_contains(column, needle)?, true),
        _ => (table, false),
    };

    if output == OutputFormat::Csv {
        let disposition = format!("attachment; filename=\"{}\"", EXPORT_FILE_NAME);
        return Ok((
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            table.to_csv()?,
        )
            .into_response());
    }

    Ok(Json(PreviewResponse {
        file_name,
        sheet: options.sheet,
        row_count: table.row_count(),
        total_rows: filtered.then_some(total_rows),
        sample_data: table.sample(SAMPLE_ROWS),
        columns: table.columns,
    })
    .into_response())
}
