//! Verification job state as stored in the registry and returned to pollers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a verification job.
///
/// Transitions only move forward: `Pending -> Running -> {Completed | Partial | Error}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// Finished with a parsed sample (or with nothing to verify).
    Completed,
    /// A file was downloaded but could not be parsed.
    Partial,
    Error,
}

impl JobStatus {
    /// Ordering used to reject regressions: pending 0, running 1, terminal 2.
    pub fn rank(self) -> i64 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Partial | JobStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Error => "error",
        }
    }
}

/// Result payload of a finished verification.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VerificationResult {
    /// Number of spreadsheet files the account can see.
    pub files_found: usize,

    /// Name of the file that was exported and parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,

    /// Leading rows keyed by column name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_data: Vec<Map<String, Value>>,

    pub message: String,
}

/// Full state record of one job. The registry always replaces it whole.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobState {
    pub status: JobStatus,

    /// Human readable description of the current step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<VerificationResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobState {
    pub fn pending() -> Self {
        Self {
            status: JobStatus::Pending,
            step: Some("Starting...".into()),
            result: None,
            error: None,
        }
    }

    pub fn running(step: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Running,
            step: Some(step.into()),
            result: None,
            error: None,
        }
    }

    pub fn completed(result: VerificationResult) -> Self {
        Self {
            status: JobStatus::Completed,
            step: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn partial(result: VerificationResult, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Partial,
            step: None,
            result: Some(result),
            error: Some(error.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            step: None,
            result: None,
            error: Some(error.into()),
        }
    }

    /// One-line description used for the job log.
    pub fn summary(&self) -> String {
        match (self.status, &self.step, &self.error, &self.result) {
            (_, Some(step), _, _) => format!("[{}] {}", self.status.as_str(), step),
            (_, None, Some(err), _) => format!("[{}] {}", self.status.as_str(), err),
            (_, None, None, Some(result)) => {
                format!("[{}] {}", self.status.as_str(), result.message)
            }
            _ => format!("[{}]", self.status.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_ranks_are_monotonic() {
        assert!(JobStatus::Pending.rank() < JobStatus::Running.rank());
        assert!(JobStatus::Running.rank() < JobStatus::Partial.rank());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn serializes_to_polling_shapes() {
        let running = serde_json::to_value(JobState::running("Listing files...")).unwrap();
        assert_eq!(
            running,
            json!({"status": "running", "step": "Listing files..."})
        );

        let failed = serde_json::to_value(JobState::failed("boom")).unwrap();
        assert_eq!(failed, json!({"status": "error", "error": "boom"}));

        let done = serde_json::to_value(JobState::completed(VerificationResult {
            files_found: 0,
            message: "nothing".into(),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            done,
            json!({"status": "completed", "result": {"files_found": 0, "message": "nothing"}})
        );
    }
}
