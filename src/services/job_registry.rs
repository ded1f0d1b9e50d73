//! JobRegistry: shared job-id -> state mapping backed by SQLite.
//!
//! Every read and write is a single statement against the `jobs` table, so
//! each key is updated atomically and the latest state is visible to the
//! HTTP handlers and to every worker sharing the pool (or the database
//! file). State records are stored as JSON and always replaced whole.

use crate::models::job::{JobState, JobStatus};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Error recorded for jobs that were still in flight when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("job `{id}` is already {status} and cannot be updated")]
    Finalized { id: String, status: &'static str },
    #[error("job `{id}` cannot move from {from} back to {to}")]
    Regression {
        id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("corrupt state for job `{id}`: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Clone)]
pub struct JobRegistry {
    /// Shared SQLite connection pool; readiness checks reuse it.
    pub db: Arc<SqlitePool>,
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> JobResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    debug!("Running {} migration statements...", statements.len());
    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

impl JobRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Register a new job as `pending` and return its id.
    ///
    /// The row is committed before this returns, so the id is pollable
    /// before any worker is told about it.
    pub async fn create(&self) -> JobResult<String> {
        let id = Uuid::new_v4().to_string();
        let state = JobState::pending();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO jobs (id, status, status_rank, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(state.status.as_str())
        .bind(state.status.rank())
        .bind(encode(&id, &state)?)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        debug!(job_id = %id, "created job");
        Ok(id)
    }

    /// Replace the state of `id`.
    ///
    /// Writes onto a terminal job and writes that would move the status
    /// backwards are refused; the stored row is left untouched.
    pub async fn set(&self, id: &str, state: &JobState) -> JobResult<()> {
        let rank = state.status.rank();
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, status_rank = ?, state = ?, updated_at = ?
             WHERE id = ? AND status_rank < 2 AND status_rank <= ?",
        )
        .bind(state.status.as_str())
        .bind(rank)
        .bind(encode(id, state)?)
        .bind(Utc::now())
        .bind(id)
        .bind(rank)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(id).await? {
            None => Err(JobError::NotFound(id.to_string())),
            Some(current) if current.status.is_terminal() => Err(JobError::Finalized {
                id: id.to_string(),
                status: current.status.as_str(),
            }),
            Some(current) => Err(JobError::Regression {
                id: id.to_string(),
                from: current.status.as_str(),
                to: state.status.as_str(),
            }),
        }
    }

    /// Current state of `id`, or `None` if no such job was ever created.
    pub async fn get(&self, id: &str) -> JobResult<Option<JobState>> {
        let row = sqlx::query_scalar::<_, String>("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        row.map(|raw| {
            serde_json::from_str(&raw).map_err(|source| JobError::Corrupt {
                id: id.to_string(),
                source,
            })
        })
        .transpose()
    }

    /// Move every job that is still `pending` or `running` to `error`.
    ///
    /// Run once at startup, before any worker exists. Returns the ids that
    /// were failed.
    pub async fn fail_interrupted(&self) -> JobResult<Vec<String>> {
        let state = JobState::failed(INTERRUPTED_MESSAGE);
        let ids = sqlx::query_scalar::<_, String>(
            "UPDATE jobs SET status = ?, status_rank = ?, state = ?, updated_at = ?
             WHERE status_rank < 2
             RETURNING id",
        )
        .bind(state.status.as_str())
        .bind(state.status.rank())
        .bind(encode("*", &state)?)
        .bind(Utc::now())
        .fetch_all(&*self.db)
        .await?;

        if !ids.is_empty() {
            info!(count = ids.len(), "failed jobs interrupted by restart");
        }
        Ok(ids)
    }

    /// Number of jobs currently in `status`.
    pub async fn count_with_status(&self, status: JobStatus) -> JobResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }
}

fn encode(id: &str, state: &JobState) -> JobResult<String> {
    serde_json::to_string(state).map_err(|source| JobError::Corrupt {
        id: id.to_string(),
        source,
    })
}
