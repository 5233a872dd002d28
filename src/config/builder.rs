//! Fluent builder for `PortalConfig`
//!
//! Required fields (name, URLs, credentials, profile paths) are constructor
//! arguments; everything else has a sensible default and a fluent setter.
//! Used by tests and by embedders that assemble config in code rather than
//! loading a TOML file.

use std::path::PathBuf;

use super::types::{PortalConfig, PortalSelectors, Tunables};

pub struct PortalConfigBuilder {
    name: String,
    entry_url: String,
    dashboard_url: String,
    username: String,
    password: String,
    master_profile_path: PathBuf,
    clone_root: PathBuf,
    headless: bool,
    selectors: PortalSelectors,
    tunables: Tunables,
}

impl PortalConfigBuilder {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        entry_url: impl Into<String>,
        master_profile_path: impl Into<PathBuf>,
        clone_root: impl Into<PathBuf>,
    ) -> Self {
        let entry_url = entry_url.into();
        Self {
            name: name.into(),
            dashboard_url: entry_url.clone(),
            entry_url,
            username: String::new(),
            password: String::new(),
            master_profile_path: master_profile_path.into(),
            clone_root: clone_root.into(),
            headless: true,
            selectors: PortalSelectors::default(),
            tunables: Tunables::default(),
        }
    }

    #[must_use]
    pub fn dashboard_url(mut self, url: impl Into<String>) -> Self {
        self.dashboard_url = url.into();
        self
    }

    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    #[must_use]
    pub fn selectors(mut self, selectors: PortalSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    #[must_use]
    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    #[must_use]
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.tunables.max_parallel = max_parallel;
        self
    }

    #[must_use]
    pub fn job_timeout_secs(mut self, secs: u64) -> Self {
        self.tunables.job_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn retry_backoff_secs(mut self, secs: u64) -> Self {
        self.tunables.retry_backoff_secs = secs;
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.tunables.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn stale_horizon_secs(mut self, secs: u64) -> Self {
        self.tunables.stale_horizon_secs = secs;
        self
    }

    #[must_use]
    pub fn ladder_budgets(mut self, soft: u32, hard: u32, nuclear: u32) -> Self {
        self.tunables.soft_max = soft;
        self.tunables.hard_max = hard;
        self.tunables.nuclear_max = nuclear;
        self
    }

    #[must_use]
    pub fn clone_file_skip_size(mut self, bytes: u64) -> Self {
        self.tunables.clone_file_skip_size = bytes;
        self
    }

    #[must_use]
    pub fn login_timeout_secs(mut self, secs: u64) -> Self {
        self.tunables.login_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn check_timeout_secs(mut self, secs: u64) -> Self {
        self.tunables.check_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn clone_login_attempts(mut self, attempts: u32) -> Self {
        self.tunables.clone_login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn idle_poll_secs(mut self, secs: u64) -> Self {
        self.tunables.idle_poll_secs = secs;
        self
    }

    #[must_use]
    pub fn build(self) -> PortalConfig {
        PortalConfig {
            name: self.name,
            entry_url: self.entry_url,
            dashboard_url: self.dashboard_url,
            username: self.username,
            password: self.password,
            master_profile_path: self.master_profile_path,
            clone_root: self.clone_root,
            headless: self.headless,
            selectors: self.selectors,
            tunables: self.tunables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = PortalConfigBuilder::new(
            "acme",
            "https://portal.example.com/entry",
            "/var/lib/formflow/master",
            "/var/lib/formflow/clones",
        )
        .credentials("agent", "secret")
        .build();

        assert_eq!(config.name(), "acme");
        assert!(config.headless());
        assert_eq!(config.tunables().max_parallel(), 3);
        assert_eq!(config.tunables().max_attempts(), 3);
        // dashboard defaults to the entry URL until overridden
        assert_eq!(config.dashboard_url(), config.entry_url());
    }

    #[test]
    fn individual_setters_override_single_tunables() {
        let config = PortalConfigBuilder::new("acme", "https://x", "/m", "/c")
            .max_parallel(8)
            .job_timeout_secs(60)
            .build();
        assert_eq!(config.tunables().max_parallel(), 8);
        assert_eq!(config.tunables().job_timeout().as_secs(), 60);
        assert_eq!(config.tunables().max_attempts(), 3);
    }
}
