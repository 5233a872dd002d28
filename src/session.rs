//! Master session supervisor
//!
//! Owns the long-lived authenticated browser whose profile directory backs
//! every per-job clone. All shared fields (driver handle, active flag,
//! freshness timestamp) sit behind one lock; jobs never touch the master
//! driver, they only read freshness and trigger checks or recovery.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PortalConfig;
use crate::driver::{BrowserProvider, Driver, LaunchOptions};
use crate::portal::PortalProbes;
use crate::profile_store::ProfileStore;
use crate::recovery::RecoverySteps;

struct MasterState {
    driver: Option<Box<dyn Driver>>,
    is_active: bool,
    last_checked_at: Instant,
}

/// Process-scoped supervisor of the master browser session
pub struct MasterSession {
    config: Arc<PortalConfig>,
    provider: Arc<dyn BrowserProvider>,
    probes: Arc<PortalProbes>,
    state: Mutex<MasterState>,
}

impl MasterSession {
    pub fn new(
        config: Arc<PortalConfig>,
        provider: Arc<dyn BrowserProvider>,
        probes: Arc<PortalProbes>,
    ) -> Self {
        Self {
            config,
            provider,
            probes,
            state: Mutex::new(MasterState {
                driver: None,
                is_active: false,
                last_checked_at: Instant::now(),
            }),
        }
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            headless: self.config.headless(),
            ..LaunchOptions::default()
        }
    }

    #[must_use]
    pub fn master_profile(&self) -> &Path {
        self.config.master_profile_path()
    }

    /// Launch the master driver and ensure it is logged in.
    ///
    /// Idempotent: an already-active session is left untouched. Failure here
    /// is fatal at process start.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.driver.is_some() && state.is_active {
            debug!("Master session already initialized");
            return Ok(());
        }

        info!("Initializing master session for portal {}", self.config.name());
        let driver = self
            .provider
            .launch(self.config.master_profile_path(), &self.launch_options())
            .await
            .context("Failed to launch master browser")?;

        driver
            .navigate(self.config.entry_url())
            .await
            .context("Failed to navigate master browser to portal entry")?;

        if !self.probes.is_logged_in(driver.as_ref()).await {
            let logged_in = tokio::time::timeout(
                self.config.tunables().login_timeout(),
                self.probes.perform_login(driver.as_ref()),
            )
            .await
            .context("Master login timed out")??;
            if !logged_in {
                anyhow::bail!("Master login rejected by portal {}", self.config.name());
            }
        }

        state.driver = Some(driver);
        state.is_active = true;
        state.last_checked_at = Instant::now();
        info!("Master session ready for portal {}", self.config.name());
        Ok(())
    }

    /// Verify the session against the portal and refresh the freshness stamp.
    ///
    /// Navigates to the dashboard so the sentinel probe reads a known page.
    /// Bounded by the check deadline; a timeout reads as not logged in.
    pub async fn check(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(driver) = state.driver.as_ref() else {
            state.is_active = false;
            return false;
        };

        let deadline = self.config.tunables().check_timeout();
        let logged_in = tokio::time::timeout(deadline, async {
            if driver.navigate(self.config.dashboard_url()).await.is_err() {
                return false;
            }
            self.probes.is_logged_in(driver.as_ref()).await
        })
        .await
        .unwrap_or(false);

        state.is_active = logged_in;
        state.last_checked_at = Instant::now();
        debug!("Master session check: logged_in={logged_in}");
        logged_in
    }

    /// `is_active` and verified within `horizon`. A stale active flag reads
    /// as unknown; callers must `check()` or recover before trusting it.
    pub async fn is_fresh(&self, horizon: Duration) -> bool {
        let state = self.state.lock().await;
        state.is_active && state.last_checked_at.elapsed() <= horizon
    }

    /// Cheap responsiveness probe for the soft recovery level
    pub(crate) async fn probe_responsive(&self) -> bool {
        let state = self.state.lock().await;
        match state.driver.as_ref() {
            Some(driver) => driver.current_url().await.is_ok(),
            None => false,
        }
    }

    /// Navigate to the entry page and log in on the existing master driver
    pub(crate) async fn relogin(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let driver = state
            .driver
            .as_ref()
            .context("No master driver to log in with")?;

        driver
            .navigate(self.config.entry_url())
            .await
            .context("Failed to navigate to portal entry")?;

        if !self.probes.is_logged_in(driver.as_ref()).await {
            let logged_in = tokio::time::timeout(
                self.config.tunables().login_timeout(),
                self.probes.perform_login(driver.as_ref()),
            )
            .await
            .context("Login timed out")??;
            if !logged_in {
                anyhow::bail!("Portal rejected login");
            }
        }

        state.is_active = true;
        state.last_checked_at = Instant::now();
        Ok(())
    }

    /// Best-effort shutdown of the current master driver
    pub(crate) async fn shutdown_driver(&self) {
        let mut state = self.state.lock().await;
        state.is_active = false;
        if let Some(driver) = state.driver.take() {
            driver.shutdown().await;
            info!("Master driver shut down");
        }
    }

    /// Launch a fresh master driver against the master profile
    pub(crate) async fn replace_driver(&self) -> anyhow::Result<()> {
        let driver = self
            .provider
            .launch(self.config.master_profile_path(), &self.launch_options())
            .await
            .context("Failed to relaunch master browser")?;

        let mut state = self.state.lock().await;
        if let Some(old) = state.driver.replace(driver) {
            // An old handle should not exist here; shut it down anyway
            warn!("Replacing a still-present master driver");
            old.shutdown().await;
        }
        Ok(())
    }

    /// Process-shutdown hook
    pub async fn shutdown(&self) {
        self.shutdown_driver().await;
    }
}

// =============================================================================
// Recovery steps against the master session
// =============================================================================

/// Concrete soft/hard/nuclear actions consumed by the recovery coordinator
pub struct MasterRecoverySteps {
    session: Arc<MasterSession>,
    profiles: Arc<ProfileStore>,
}

impl MasterRecoverySteps {
    pub fn new(session: Arc<MasterSession>, profiles: Arc<ProfileStore>) -> Self {
        Self { session, profiles }
    }
}

#[async_trait]
impl RecoverySteps for MasterRecoverySteps {
    /// Re-login on the live driver; escalates when the driver is unresponsive
    async fn soft(&self) -> Result<(), String> {
        if !self.session.probe_responsive().await {
            return Err("master driver unresponsive".to_string());
        }
        self.session.relogin().await.map_err(|e| format!("{e:#}"))
    }

    /// Relaunch the driver on the same profile and log in again
    async fn hard(&self) -> Result<(), String> {
        self.session.shutdown_driver().await;
        self.session
            .replace_driver()
            .await
            .map_err(|e| format!("{e:#}"))?;
        self.session.relogin().await.map_err(|e| format!("{e:#}"))
    }

    /// Wipe the master profile and rebuild the session from a fresh login.
    ///
    /// The profile is moved aside first so a failed fresh login can put the
    /// old state back before surfacing the error.
    async fn nuclear(&self) -> Result<(), String> {
        let master = self.session.master_profile().to_path_buf();

        self.session.shutdown_driver().await;

        let backup = self
            .profiles
            .backup(&master)
            .map_err(|e| format!("profile backup failed: {e}"))?;
        if let Err(e) = std::fs::create_dir_all(&master) {
            let _ = self.profiles.restore(&backup, &master);
            return Err(format!("failed to recreate master profile dir: {e}"));
        }

        let rebuilt = async {
            self.session
                .replace_driver()
                .await
                .map_err(|e| format!("{e:#}"))?;
            self.session.relogin().await.map_err(|e| format!("{e:#}"))
        }
        .await;

        match rebuilt {
            Ok(()) => Ok(()),
            Err(reason) => {
                warn!("Nuclear recovery failed, restoring profile backup: {reason}");
                self.session.shutdown_driver().await;
                if let Err(e) = self.profiles.restore(&backup, &master) {
                    warn!("Profile restore after failed nuclear recovery also failed: {e}");
                }
                Err(reason)
            }
        }
    }
}
