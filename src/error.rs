//! Error taxonomy for job execution, driver I/O and the queue store.
//!
//! Every failure that reaches the scheduler is classified relative to the
//! portal's submit action: pre-submission failures are retriable, a
//! post-submission failure is terminal on the first attempt so the external
//! side effect can never be duplicated.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a failure occurred relative to the portal's submit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    /// Before the portal accepted the submission. Retriable.
    PreSubmission,
    /// After the portal accepted the submission. Never retried.
    PostSubmission,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreSubmission => write!(f, "pre-submission"),
            Self::PostSubmission => write!(f, "post-submission"),
        }
    }
}

/// Job-level failure classification
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Failure before the portal's submit action completed
    #[error("pre-submission failure: {0}")]
    PreSubmission(String),

    /// Failure after the portal accepted the submission
    #[error("post-submission failure: {0}")]
    PostSubmission(String),

    /// Clone validator found a dead session; a master recovery was requested
    #[error("portal session expired")]
    SessionExpired,

    /// The job's hard deadline fired
    #[error("job deadline of {0:?} elapsed")]
    Timeout(Duration),

    /// All recovery levels failed; the critical hook has been fired
    #[error("session recovery exhausted")]
    RecoveryExhausted,

    /// Profile directory operation failed
    #[error(transparent)]
    Profile(#[from] ProfileError),

    /// Browser could not be launched for this job
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    /// Driver I/O failure below the form-fill layer
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Anything the per-job pipeline did not anticipate
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl JobError {
    /// Stage discriminator used by the queue's fail transition.
    ///
    /// Everything except an explicit post-submission report classifies as
    /// pre-submission so the retry branch stays reachable.
    #[must_use]
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::PostSubmission(_) => FailureStage::PostSubmission,
            _ => FailureStage::PreSubmission,
        }
    }

    /// Short machine-readable kind for error-log records
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreSubmission(_) => "pre_submission",
            Self::PostSubmission(_) => "post_submission",
            Self::SessionExpired => "session_expired",
            Self::Timeout(_) => "timeout",
            Self::RecoveryExhausted => "recovery_exhausted",
            Self::Profile(_) => "profile_io",
            Self::BrowserLaunch(_) => "browser_launch",
            Self::Driver(_) => "driver",
            Self::Unexpected(_) => "unexpected",
        }
    }

    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.stage() == FailureStage::PreSubmission
    }
}

/// Driver I/O errors surfaced by the browser provider
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("DOM lookup `{selector}` failed: {message}")]
    Dom { selector: String, message: String },

    #[error("screenshot capture failed: {0}")]
    Screenshot(String),

    #[error("driver connection lost: {0}")]
    Connection(String),
}

/// Profile store failures
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup not found at {0}")]
    MissingBackup(PathBuf),
}

impl ProfileError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Queue store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("malformed job record {id}: {message}")]
    Corrupt { id: String, message: String },
}
