//! Job dispatch loop with bounded concurrency
//!
//! Claims pending jobs for one portal and runs up to `max_parallel` of them
//! at a time. On boot every `processing` leftover from a crashed run is reset
//! before the loop starts; on shutdown in-flight jobs are cancelled and their
//! drop-based cleanup runs.

pub mod executor;

pub use executor::JobExecutor;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Tunables;
use crate::error::FailureStage;
use crate::job_queue::{ErrorRecord, Job, JobStore};

/// Pumps one portal's queue through a [`JobExecutor`]
pub struct Scheduler {
    portal: String,
    store: Arc<JobStore>,
    executor: Arc<JobExecutor>,
    tunables: Tunables,
}

impl Scheduler {
    pub fn new(
        portal: impl Into<String>,
        store: Arc<JobStore>,
        executor: Arc<JobExecutor>,
        tunables: Tunables,
    ) -> Self {
        Self {
            portal: portal.into(),
            store,
            executor,
            tunables,
        }
    }

    /// Run the dispatch loop until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        // Crash recovery: nothing can legitimately be processing at boot
        let reset = self.store.recover_stuck(Duration::ZERO).await?;
        if reset > 0 {
            info!("Reset {reset} jobs stuck in processing from a previous run");
        }

        let max_parallel = self.tunables.max_parallel();
        let idle_poll = self.tunables.idle_poll();
        info!(
            "Scheduler started for portal {} (max {max_parallel} parallel jobs)",
            self.portal
        );

        let mut active: FuturesUnordered<JoinHandle<String>> = FuturesUnordered::new();

        loop {
            // Fill up to the concurrency limit
            if !*shutdown.borrow() {
                while active.len() < max_parallel {
                    match self.store.claim_next(&self.portal).await {
                        Ok(Some(job)) => {
                            debug!("Claimed job {} (attempt {})", job.id, job.attempts);
                            active.push(self.spawn_job(job));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Claim failed, backing off: {e}");
                            break;
                        }
                    }
                }
            }

            if active.is_empty() {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(idle_poll) => {}
                    _ = shutdown.changed() => {}
                }
            } else {
                tokio::select! {
                    finished = active.next() => match finished {
                        Some(Ok(job_id)) => debug!("Job {job_id} finished"),
                        Some(Err(e)) => error!("Job task failed to join: {e}"),
                        None => {}
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(
                                "Shutdown: cancelling {} in-flight jobs on portal {}",
                                active.len(),
                                self.portal
                            );
                            for handle in active.iter() {
                                handle.abort();
                            }
                            // Drain so cancelled tasks run their drop cleanup;
                            // their queue rows are reset at next boot.
                            while active.next().await.is_some() {}
                            break;
                        }
                    }
                }
            }
        }

        info!("Scheduler stopped for portal {}", self.portal);
        Ok(())
    }

    /// Spawn one job task with the unexpected-error safety net.
    ///
    /// A panic inside the executor still transitions the job off
    /// `processing`, classified as retriable.
    fn spawn_job(&self, job: Job) -> JoinHandle<String> {
        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        let backoff = self.tunables.retry_backoff();

        tokio::spawn(async move {
            let job_id = job.id.clone();
            let attempt = job.attempts;

            let run = std::panic::AssertUnwindSafe(executor.run_job(job)).catch_unwind();
            if run.await.is_err() {
                error!("Job {job_id} panicked during execution");
                let record = ErrorRecord {
                    timestamp: Utc::now(),
                    attempt_number: attempt,
                    message: "job task panicked".to_string(),
                    kind: "panic".to_string(),
                    stage: FailureStage::PreSubmission,
                    screenshot_ref: None,
                };
                if let Err(e) = store.fail(&job_id, record, backoff).await {
                    error!("Failed to record panic for job {job_id}: {e}");
                }
            }

            job_id
        })
    }
}
