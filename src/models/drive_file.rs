//! Lightweight snapshot of a remote Drive file.

use serde::{Deserialize, Serialize};

/// Native Google Sheets document; must be exported before download.
pub const GOOGLE_SHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
/// Office Open XML workbook, also the export target for native sheets.
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const XLS_MIME: &str = "application/vnd.ms-excel";
pub const ODS_MIME: &str = "application/vnd.oasis.opendocument.spreadsheet";
pub const CSV_MIME: &str = "text/csv";

/// Every MIME type the listing asks Drive for, in query order.
pub const SPREADSHEET_MIME_TYPES: [&str; 5] =
    [GOOGLE_SHEET_MIME, XLSX_MIME, XLS_MIME, ODS_MIME, CSV_MIME];

/// Identity of a file returned by a Drive listing.
///
/// Field names follow the Drive v3 JSON representation so listing results
/// deserialize directly and are echoed back to clients unchanged.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
}

/// How a spreadsheet-like file has to be fetched and parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadsheetKind {
    /// Native Google Sheet, exported to XLSX.
    GoogleSheet,
    /// Binary or zipped workbook downloaded as-is.
    Workbook,
    /// Plain comma separated text downloaded as-is.
    Csv,
}

impl FileSummary {
    /// Handle for a native sheet known only by its id.
    pub fn google_sheet(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            mime_type: GOOGLE_SHEET_MIME.to_string(),
            modified_time: None,
        }
    }

    /// Classify the file by MIME type; `None` for anything that is not a
    /// spreadsheet.
    pub fn spreadsheet_kind(&self) -> Option<SpreadsheetKind> {
        match self.mime_type.as_str() {
            GOOGLE_SHEET_MIME => Some(SpreadsheetKind::GoogleSheet),
            XLSX_MIME | XLS_MIME | ODS_MIME => Some(SpreadsheetKind::Workbook),
            CSV_MIME => Some(SpreadsheetKind::Csv),
            _ => None,
        }
    }
}

/// Spreadsheet id from a `docs.google.com/spreadsheets/d/<id>/...` URL or a
/// bare id. `None` when the input is neither.
pub fn spreadsheet_id(input: &str) -> Option<&str> {
    let input = input.trim();
    let candidate = match input.split_once("/spreadsheets/d/") {
        Some((_, rest)) => rest.split(['/', '?', '#']).next().unwrap_or_default(),
        None if input.contains('/') => return None,
        None => input,
    };
    let valid = !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(candidate)
}
