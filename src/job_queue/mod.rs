//! Durable job queue over SQLite
//!
//! One `jobs` table holds every unit of work. Claiming is a single atomic
//! `UPDATE … RETURNING` so concurrent scheduler workers can never double-pop
//! a job, and all timestamps are unix milliseconds. WAL mode keeps the status
//! API's reads cheap while the scheduler writes.

pub mod types;

pub use types::{ErrorRecord, Job, JobStatus, StatusCounts};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{FailureStage, StoreError};

/// SQL schema for the queue database
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    correlation_key TEXT NOT NULL,
    portal TEXT NOT NULL,
    form_data TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    failed_at INTEGER,
    last_attempt_at INTEGER,
    next_retry_at INTEGER,
    error_log TEXT NOT NULL DEFAULT '[]',
    last_error TEXT,
    final_error TEXT
);

-- Claim scans and status listings
CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);

-- One job per upstream document; also the dedup point for the change feed
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_correlation ON jobs(correlation_key);

-- Per-portal claim filtering
CREATE INDEX IF NOT EXISTS idx_jobs_portal_status ON jobs(portal, status);
"#;

/// Durable queue store; cheap to clone, shares one connection pool
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open the queue database, creating file and schema when missing.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        info!("Opened job queue database at {}", db_path.display());
        Ok(Self { pool })
    }

    /// Create a `pending` job for an upstream document.
    ///
    /// A job with the same correlation key already present makes this a
    /// no-op; the surviving job's id is returned either way, so at-least-once
    /// delivery from the change feed collapses here.
    pub async fn enqueue(
        &self,
        portal: &str,
        correlation_key: &str,
        form_data: &serde_json::Value,
        max_attempts: u32,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, correlation_key, portal, form_data, status, max_attempts, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(correlation_key) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(correlation_key)
        .bind(portal)
        .bind(form_data.to_string())
        .bind(max_attempts)
        .bind(now_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            let existing: (String,) =
                sqlx::query_as("SELECT id FROM jobs WHERE correlation_key = ?")
                    .bind(correlation_key)
                    .fetch_one(&self.pool)
                    .await?;
            debug!("Duplicate enqueue for {correlation_key}, keeping job {}", existing.0);
            return Ok(existing.0);
        }

        debug!("Enqueued job {id} for {correlation_key}");
        Ok(id)
    }

    /// Atomically pop the oldest eligible `pending` job for `portal`.
    ///
    /// Sets `processing`, stamps `started_at`/`last_attempt_at` and
    /// increments `attempts` in the same statement, so concurrent workers
    /// can never claim the same job twice.
    pub async fn claim_next(&self, portal: &str) -> Result<Option<Job>, StoreError> {
        let now = now_millis();
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = ?1, last_attempt_at = ?1,
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE portal = ?2 AND status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(portal)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// `processing → completed`; completion is final.
    pub async fn complete(&self, job_id: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(now_millis())
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(job_id, "completed").await);
        }
        Ok(())
    }

    /// Record a failure and route the job by its class.
    ///
    /// Pre-submission failures with budget left go back to `pending` with
    /// `next_retry_at = now + backoff`; everything else lands on the matching
    /// terminal status. The error record is appended in the same transaction
    /// as the transition, so a terminal job always carries its final error.
    pub async fn fail(
        &self,
        job_id: &str,
        record: ErrorRecord,
        backoff: Duration,
    ) -> Result<JobStatus, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status, attempts, max_attempts, error_log FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let status: String = row.try_get("status")?;
        if status != "processing" {
            return Err(StoreError::IllegalTransition {
                id: job_id.to_string(),
                from: status,
                to: "failed".to_string(),
            });
        }
        let attempts: u32 = row.try_get("attempts")?;
        let max_attempts: u32 = row.try_get("max_attempts")?;
        let mut error_log = parse_error_log(job_id, &row)?;

        let message = record.message.clone();
        let stage = record.stage;
        error_log.push(record);
        let error_log_json =
            serde_json::to_string(&error_log).expect("error log serializes");

        let now = now_millis();
        let retriable = stage == FailureStage::PreSubmission && attempts < max_attempts;
        let next_status = if retriable {
            JobStatus::Pending
        } else if stage == FailureStage::PreSubmission {
            JobStatus::FailedPreSubmission
        } else {
            JobStatus::FailedPostSubmission
        };

        if retriable {
            let retry_at = now + backoff.as_millis() as i64;
            sqlx::query(
                "UPDATE jobs SET status = 'pending', next_retry_at = ?, \
                 error_log = ?, last_error = ? WHERE id = ?",
            )
            .bind(retry_at)
            .bind(&error_log_json)
            .bind(&message)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            debug!("Job {job_id} requeued after attempt {attempts} ({message})");
        } else {
            sqlx::query(
                "UPDATE jobs SET status = ?, failed_at = ?, next_retry_at = NULL, \
                 error_log = ?, last_error = ?, final_error = ? WHERE id = ?",
            )
            .bind(next_status.as_str())
            .bind(now)
            .bind(&error_log_json)
            .bind(&message)
            .bind(&message)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            warn!("Job {job_id} terminal as {next_status} after attempt {attempts}: {message}");
        }

        tx.commit().await?;
        Ok(next_status)
    }

    /// Reset `processing` jobs older than `max_age` after a crash.
    ///
    /// Attempts are preserved. A job that had already consumed its whole
    /// attempt budget when the process died goes straight to the terminal
    /// pre-submission failure with a synthetic error record, so no job can
    /// ever be dispatched past `max_attempts`.
    pub async fn recover_stuck(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, attempts, max_attempts, error_log FROM jobs \
             WHERE status = 'processing' AND started_at <= ?",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reset = 0usize;
        for row in &rows {
            let id: String = row.try_get("id")?;
            let attempts: u32 = row.try_get("attempts")?;
            let max_attempts: u32 = row.try_get("max_attempts")?;

            if attempts >= max_attempts {
                let mut error_log = parse_error_log(&id, row)?;
                let message = "process restarted with attempt budget exhausted".to_string();
                error_log.push(ErrorRecord {
                    timestamp: Utc::now(),
                    attempt_number: attempts,
                    message: message.clone(),
                    kind: "stuck".to_string(),
                    stage: FailureStage::PreSubmission,
                    screenshot_ref: None,
                });
                sqlx::query(
                    "UPDATE jobs SET status = 'failed_pre_submission', failed_at = ?, \
                     error_log = ?, last_error = ?, final_error = ? WHERE id = ?",
                )
                .bind(now_millis())
                .bind(serde_json::to_string(&error_log).expect("error log serializes"))
                .bind(&message)
                .bind(&message)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', next_retry_at = NULL WHERE id = ?",
                )
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            }
            reset += 1;
        }

        tx.commit().await?;
        if reset > 0 {
            info!("Recovered {reset} stuck jobs back into the queue");
        }
        Ok(reset)
    }

    /// Fetch one job by id.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Fetch one job by its upstream correlation key.
    pub async fn get_by_correlation(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE correlation_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Paginated listing by status, newest first. Read-only.
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let per_page = per_page.clamp(1, 200);
        let offset = i64::from(page) * i64::from(per_page);
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(status.as_str())
        .bind(i64::from(per_page))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Aggregate counts by status. Read-only.
    pub async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = count,
                Some(JobStatus::Processing) => counts.processing = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::FailedPreSubmission) => counts.failed_pre_submission = count,
                Some(JobStatus::FailedPostSubmission) => counts.failed_post_submission = count,
                None => warn!("Unknown status {status} in queue database"),
            }
        }
        Ok(counts)
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Access to the pool for the intake feed sharing this database
    #[must_use]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn transition_error(&self, job_id: &str, to: &str) -> StoreError {
        match self.get(job_id).await {
            Ok(Some(job)) => StoreError::IllegalTransition {
                id: job_id.to_string(),
                from: job.status.as_str().to_string(),
                to: to.to_string(),
            },
            Ok(None) => StoreError::NotFound(job_id.to_string()),
            Err(e) => e,
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn parse_error_log(id: &str, row: &SqliteRow) -> Result<Vec<ErrorRecord>, StoreError> {
    let raw: String = row.try_get("error_log")?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        id: id.to_string(),
        message: format!("error_log is not valid JSON: {e}"),
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;

    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw).ok_or_else(|| StoreError::Corrupt {
        id: id.clone(),
        message: format!("unknown status `{status_raw}`"),
    })?;

    let form_raw: String = row.try_get("form_data")?;
    let form_data = serde_json::from_str(&form_raw).map_err(|e| StoreError::Corrupt {
        id: id.clone(),
        message: format!("form_data is not valid JSON: {e}"),
    })?;

    let error_log = parse_error_log(&id, row)?;

    let opt_ts = |name: &str| -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        Ok(row.try_get::<Option<i64>, _>(name)?.map(millis_to_datetime))
    };

    Ok(Job {
        correlation_key: row.try_get("correlation_key")?,
        portal: row.try_get("portal")?,
        form_data,
        status,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
        started_at: opt_ts("started_at")?,
        completed_at: opt_ts("completed_at")?,
        failed_at: opt_ts("failed_at")?,
        last_attempt_at: opt_ts("last_attempt_at")?,
        next_retry_at: opt_ts("next_retry_at")?,
        error_log,
        last_error: row.try_get("last_error")?,
        final_error: row.try_get("final_error")?,
        id,
    })
}
