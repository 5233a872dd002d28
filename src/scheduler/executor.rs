//! Per-job execution pipeline
//!
//! Claimed job in, queue transition out. The pipeline is: session gate,
//! profile clone, browser launch, navigate + validate, form fill, classify.
//! Everything from the clone onward runs under the job's hard deadline, and
//! the clone directory and browser are torn down on every exit path; the
//! deadline and cancellation paths rely on drop semantics of the lease and
//! driver handle.

use std::sync::Arc;

use chrono::Utc;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::collaborators::BlobStore;
use crate::config::PortalConfig;
use crate::driver::{BrowserProvider, Driver, LaunchOptions};
use crate::error::{FailureStage, JobError};
use crate::job_queue::{ErrorRecord, Job, JobStore};
use crate::portal::{CloneValidation, FormFiller, FormOutcome, PortalProbes};
use crate::profile_store::{CloneLease, ProfileStore};
use crate::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::session::MasterSession;

/// What one drive of the browser produced
enum DriveResult {
    /// The form routine ran and reported a structured outcome
    Outcome(FormOutcome),
    /// The pipeline failed below the form routine
    Failed {
        error: JobError,
        screenshot_ref: Option<String>,
    },
}

/// Executes claimed jobs against one portal instance
pub struct JobExecutor {
    config: Arc<PortalConfig>,
    store: Arc<JobStore>,
    profiles: Arc<ProfileStore>,
    provider: Arc<dyn BrowserProvider>,
    probes: Arc<PortalProbes>,
    session: Arc<MasterSession>,
    recovery: Arc<RecoveryCoordinator>,
    form_filler: Arc<dyn FormFiller>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PortalConfig>,
        store: Arc<JobStore>,
        profiles: Arc<ProfileStore>,
        provider: Arc<dyn BrowserProvider>,
        probes: Arc<PortalProbes>,
        session: Arc<MasterSession>,
        recovery: Arc<RecoveryCoordinator>,
        form_filler: Arc<dyn FormFiller>,
        blobs: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        Self {
            config,
            store,
            profiles,
            provider,
            probes,
            session,
            recovery,
            form_filler,
            blobs,
        }
    }

    /// Run one claimed job to a queue transition.
    ///
    /// Never leaves the job in `processing`: every branch ends in
    /// `complete` or `fail`, and a store error on those writes is logged so
    /// startup crash recovery can pick the row up.
    pub async fn run_job(&self, job: Job) {
        let tunables = self.config.tunables();
        debug!("Executing job {} (attempt {})", job.id, job.attempts);

        // Session gate, before any clone exists. A stale active flag is
        // unknown: verify it, and only recover when verification fails.
        if !self.session.is_fresh(tunables.stale_horizon()).await {
            debug!("Master session stale or inactive, checking before clone");
            if !self.session.check().await {
                let outcome = self.recovery.recover().await;
                if !outcome.is_recovered() {
                    let error = match outcome {
                        RecoveryOutcome::Exhausted => JobError::RecoveryExhausted,
                        _ => JobError::PreSubmission("master session unavailable".to_string()),
                    };
                    self.record_failure(&job, &error, None).await;
                    return;
                }
            }
        }

        let deadline = tunables.job_timeout();
        match tokio::time::timeout(deadline, self.drive(&job)).await {
            Ok(DriveResult::Outcome(outcome)) => self.record_outcome(&job, outcome).await,
            Ok(DriveResult::Failed {
                error,
                screenshot_ref,
            }) => self.record_failure(&job, &error, screenshot_ref).await,
            Err(_elapsed) => {
                // The drive future was dropped at an await point: the clone
                // lease and driver handle tore down browser and directory.
                warn!("Job {} hit the {deadline:?} deadline", job.id);
                self.record_failure(&job, &JobError::Timeout(deadline), None)
                    .await;
            }
        }
    }

    /// Clone, launch, validate, fill. Owns the clone lease and driver handle
    /// so dropping this future cleans both up.
    async fn drive(&self, job: &Job) -> DriveResult {
        // Profile copy is a directory tree walk; keep it off the runtime
        let profiles = Arc::clone(&self.profiles);
        let master = self.config.master_profile_path().to_path_buf();
        let job_id = job.id.clone();
        let layout = match task::spawn_blocking(move || profiles.clone_profile(&master, &job_id))
            .await
        {
            Ok(Ok(layout)) => layout,
            Ok(Err(e)) => {
                return DriveResult::Failed {
                    error: JobError::Profile(e),
                    screenshot_ref: None,
                };
            }
            Err(e) => {
                return DriveResult::Failed {
                    error: JobError::Unexpected(format!("profile clone task died: {e}")),
                    screenshot_ref: None,
                };
            }
        };
        let lease = CloneLease::new(layout);

        let options = LaunchOptions {
            headless: self.config.headless(),
            ..LaunchOptions::default()
        };
        let driver = match self.provider.launch(lease.user_data_dir(), &options).await {
            Ok(driver) => driver,
            Err(e) => {
                lease.release();
                return DriveResult::Failed {
                    error: JobError::BrowserLaunch(e.to_string()),
                    screenshot_ref: None,
                };
            }
        };

        let result = self.drive_with_driver(job, driver.as_ref()).await;

        // Failure evidence while the page is still alive
        let screenshot_ref = match &result {
            Ok(outcome) if !outcome.success && outcome.screenshot_ref.is_none() => {
                self.capture_failure_screenshot(driver.as_ref(), job).await
            }
            Err(_) => self.capture_failure_screenshot(driver.as_ref(), job).await,
            _ => None,
        };

        driver.shutdown().await;
        lease.release();

        match result {
            Ok(mut outcome) => {
                if outcome.screenshot_ref.is_none() {
                    outcome.screenshot_ref = screenshot_ref;
                }
                DriveResult::Outcome(outcome)
            }
            Err(error) => DriveResult::Failed {
                error,
                screenshot_ref,
            },
        }
    }

    async fn drive_with_driver(
        &self,
        job: &Job,
        driver: &dyn Driver,
    ) -> Result<FormOutcome, JobError> {
        driver.navigate(self.config.entry_url()).await?;

        match self
            .probes
            .validate_or_recover_clone(driver, &self.recovery)
            .await
        {
            CloneValidation::Valid => {}
            CloneValidation::Invalid => return Err(JobError::SessionExpired),
        }

        self.form_filler
            .fill_and_submit(driver, &job.form_data)
            .await
            .map_err(|e| JobError::Unexpected(format!("form routine error: {e:#}")))
    }

    /// Screenshot the failing page and push it to the blob store.
    /// Never masks the original failure.
    async fn capture_failure_screenshot(
        &self,
        driver: &dyn Driver,
        job: &Job,
    ) -> Option<String> {
        let blobs = self.blobs.as_ref()?;
        let bytes = match driver.screenshot().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failure screenshot for job {} not captured: {e}", job.id);
                return None;
            }
        };

        let key = format!("jobs/{}/attempt-{}.png", job.id, job.attempts);
        match blobs.upload(bytes, &key).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Failure screenshot for job {} not uploaded: {e:#}", job.id);
                None
            }
        }
    }

    async fn record_outcome(&self, job: &Job, outcome: FormOutcome) {
        if outcome.success {
            match self.store.complete(&job.id).await {
                Ok(()) => info!("Job {} completed", job.id),
                Err(e) => error!("Failed to mark job {} completed: {e}", job.id),
            }
            return;
        }

        let stage = outcome.stage;
        let record = ErrorRecord {
            timestamp: Utc::now(),
            attempt_number: job.attempts,
            message: outcome
                .error
                .unwrap_or_else(|| "form routine reported failure".to_string()),
            kind: match stage {
                FailureStage::PreSubmission => "pre_submission".to_string(),
                FailureStage::PostSubmission => "post_submission".to_string(),
            },
            stage,
            screenshot_ref: outcome.screenshot_ref,
        };
        self.write_failure(&job.id, record).await;
    }

    async fn record_failure(&self, job: &Job, error: &JobError, screenshot_ref: Option<String>) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            attempt_number: job.attempts,
            message: error.to_string(),
            kind: error.kind().to_string(),
            stage: error.stage(),
            screenshot_ref,
        };
        self.write_failure(&job.id, record).await;
    }

    async fn write_failure(&self, job_id: &str, record: ErrorRecord) {
        let backoff = self.config.tunables().retry_backoff();
        match self.store.fail(job_id, record, backoff).await {
            Ok(status) => debug!("Job {job_id} transitioned to {status}"),
            Err(e) => error!("Failed to record failure for job {job_id}: {e}"),
        }
    }
}
