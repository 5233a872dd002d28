//! Getter methods for configuration types
//!
//! Accessors for `OrchestratorConfig`, `PortalConfig` and `Tunables`.
//! Second-granularity fields are surfaced as `Duration`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::types::{OrchestratorConfig, PortalConfig, PortalSelectors, Tunables};

impl OrchestratorConfig {
    #[must_use]
    pub fn queue_db_path(&self) -> &Path {
        &self.queue_db_path
    }

    /// Intake database path; falls back to the queue database
    #[must_use]
    pub fn intake_db_path(&self) -> &Path {
        self.intake_db_path.as_deref().unwrap_or(&self.queue_db_path)
    }

    #[must_use]
    pub fn status_api_addr(&self) -> Option<SocketAddr> {
        self.status_api_addr
    }

    #[must_use]
    pub fn ocr_endpoint(&self) -> Option<&str> {
        self.ocr_endpoint.as_deref()
    }

    #[must_use]
    pub fn blob_endpoint(&self) -> Option<&str> {
        self.blob_endpoint.as_deref()
    }

    #[must_use]
    pub fn portals(&self) -> &[PortalConfig] {
        &self.portals
    }
}

impl PortalConfig {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn entry_url(&self) -> &str {
        &self.entry_url
    }

    #[must_use]
    pub fn dashboard_url(&self) -> &str {
        &self.dashboard_url
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    #[must_use]
    pub fn master_profile_path(&self) -> &Path {
        &self.master_profile_path
    }

    #[must_use]
    pub fn clone_root(&self) -> &PathBuf {
        &self.clone_root
    }

    #[must_use]
    pub fn headless(&self) -> bool {
        self.headless
    }

    #[must_use]
    pub fn selectors(&self) -> &PortalSelectors {
        &self.selectors
    }

    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

impl Tunables {
    #[must_use]
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn stale_horizon(&self) -> Duration {
        Duration::from_secs(self.stale_horizon_secs)
    }

    #[must_use]
    pub fn soft_max(&self) -> u32 {
        self.soft_max
    }

    #[must_use]
    pub fn hard_max(&self) -> u32 {
        self.hard_max
    }

    #[must_use]
    pub fn nuclear_max(&self) -> u32 {
        self.nuclear_max
    }

    #[must_use]
    pub fn clone_file_skip_size(&self) -> u64 {
        self.clone_file_skip_size
    }

    #[must_use]
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    #[must_use]
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    #[must_use]
    pub fn clone_login_attempts(&self) -> u32 {
        self.clone_login_attempts
    }

    #[must_use]
    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }
}
