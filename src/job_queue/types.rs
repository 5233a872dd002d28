//! Persistent job record types
//!
//! The authoritative schema of the queue store. `error_log` is an append-only
//! sequence bounded by the attempt count; `last_error` and `final_error` are
//! denormalised conveniences for operator tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureStage;

/// Lifecycle states of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    FailedPreSubmission,
    FailedPostSubmission,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::FailedPreSubmission => "failed_pre_submission",
            Self::FailedPostSubmission => "failed_post_submission",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed_pre_submission" => Some(Self::FailedPreSubmission),
            "failed_post_submission" => Some(Self::FailedPostSubmission),
            _ => None,
        }
    }

    /// Terminal states are never mutated again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::FailedPreSubmission | Self::FailedPostSubmission
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failure entry in a job's append-only error log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub attempt_number: u32,
    pub message: String,
    /// Machine-readable kind, e.g. `timeout`, `session_expired`
    pub kind: String,
    pub stage: FailureStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
}

/// A persisted unit of work
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    /// Upstream document id; unique across the queue
    pub correlation_key: String,
    /// Portal instance this job is routed to
    pub portal: String,
    /// Opaque payload handed to the form filler
    pub form_data: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_log: Vec<ErrorRecord>,
    pub last_error: Option<String>,
    pub final_error: Option<String>,
}

/// Aggregate counts for the status surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed_pre_submission: i64,
    pub failed_post_submission: i64,
}
