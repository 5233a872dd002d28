//! Portal-specific probes and the form-filling seam
//!
//! Three probes are owned here: the logged-in sentinel check, the
//! CAPTCHA-driven login, and the cloned-session validator that closes the
//! race between a stale clone snapshot and a master recovery. The form-fill
//! body itself is a pluggable [`FormFiller`]; the core consumes only its
//! structured [`FormOutcome`].

pub mod form;

pub use form::BasicFormFiller;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::collaborators::CaptchaSolver;
use crate::config::PortalConfig;
use crate::driver::Driver;
use crate::error::FailureStage;
use crate::recovery::RecoveryCoordinator;

/// Interval between post-submit login re-checks
const LOGIN_SETTLE_INTERVAL: Duration = Duration::from_secs(2);
/// Re-checks after submitting the login form
const LOGIN_SETTLE_CHECKS: u32 = 3;
/// Single wait applied to an ambiguous page before re-evaluating
const AMBIGUITY_WAIT: Duration = Duration::from_secs(3);

/// Structured result of the external form-filling routine
#[derive(Debug, Clone)]
pub struct FormOutcome {
    pub success: bool,
    /// Stage the routine reached; decides the failure class when `!success`
    pub stage: FailureStage,
    pub error: Option<String>,
    pub screenshot_ref: Option<String>,
}

impl FormOutcome {
    /// Submission accepted and all subsequent pages completed
    #[must_use]
    pub fn success() -> Self {
        Self {
            success: true,
            stage: FailureStage::PostSubmission,
            error: None,
            screenshot_ref: None,
        }
    }

    #[must_use]
    pub fn failed(stage: FailureStage, error: impl Into<String>) -> Self {
        Self {
            success: false,
            stage,
            error: Some(error.into()),
            screenshot_ref: None,
        }
    }
}

/// The portal-specific form automation, supplied by the embedder
#[async_trait]
pub trait FormFiller: Send + Sync {
    async fn fill_and_submit(
        &self,
        driver: &dyn Driver,
        form_data: &serde_json::Value,
    ) -> anyhow::Result<FormOutcome>;
}

/// Verdict of the cloned-session validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneValidation {
    Valid,
    /// Session dead or page ambiguous; the job fails with the retriable class
    Invalid,
}

// =============================================================================
// PortalProbes
// =============================================================================

/// Sentinel-element probes bound to one portal's selectors and credentials
pub struct PortalProbes {
    config: Arc<PortalConfig>,
    solver: Arc<dyn CaptchaSolver>,
}

impl PortalProbes {
    pub fn new(config: Arc<PortalConfig>, solver: Arc<dyn CaptchaSolver>) -> Self {
        Self { config, solver }
    }

    /// Logged-in check: dashboard marker present, login form absent
    pub async fn is_logged_in(&self, driver: &dyn Driver) -> bool {
        let selectors = self.config.selectors();
        let dashboard = driver.find(&selectors.dashboard_marker).await.unwrap_or(false);
        if !dashboard {
            return false;
        }
        let login_form = driver.find(&selectors.login_form_marker).await.unwrap_or(false);
        !login_form
    }

    /// Fill and submit the login form using a fresh CAPTCHA capture.
    ///
    /// Returns `Ok(false)` when the portal rejected the credentials or the
    /// CAPTCHA; driver-level failures propagate.
    pub async fn perform_login(&self, driver: &dyn Driver) -> anyhow::Result<bool> {
        let selectors = self.config.selectors();

        let captcha_image = driver.element_screenshot(&selectors.captcha_image).await?;
        let captcha_text = self.solver.ocr(&captcha_image).await?;
        debug!("CAPTCHA resolved to {} characters", captcha_text.len());

        driver
            .type_into(&selectors.username_field, self.config.username())
            .await?;
        driver
            .type_into(&selectors.password_field, self.config.password())
            .await?;
        driver
            .type_into(&selectors.captcha_field, &captcha_text)
            .await?;
        driver.click(&selectors.submit_button).await?;

        for _ in 0..LOGIN_SETTLE_CHECKS {
            driver.sleep(LOGIN_SETTLE_INTERVAL).await;
            if self.is_logged_in(driver).await {
                info!("Login succeeded on portal {}", self.config.name());
                return Ok(true);
            }
        }

        warn!("Login did not reach the dashboard on portal {}", self.config.name());
        Ok(false)
    }

    /// Validate a freshly navigated cloned session.
    ///
    /// A clone snapshots the master profile an instant before the master may
    /// expire, so "master is active" says nothing about this clone. When the
    /// login form shows, a direct login is attempted on the clone itself;
    /// only after that fails is a master recovery requested (joining one
    /// already in flight), and the job is failed with the retriable class.
    pub async fn validate_or_recover_clone(
        &self,
        driver: &dyn Driver,
        recovery: &RecoveryCoordinator,
    ) -> CloneValidation {
        let selectors = self.config.selectors();
        let mut waited = false;

        loop {
            if driver.find(&selectors.login_form_marker).await.unwrap_or(false) {
                return self.login_clone_or_recover(driver, recovery).await;
            }

            if driver.find(&selectors.dashboard_marker).await.unwrap_or(false) {
                debug!("Clone session valid: dashboard marker present");
                return CloneValidation::Valid;
            }

            let url = driver.current_url().await.unwrap_or_default();
            if url.contains(&selectors.login_path) {
                return self.login_clone_or_recover(driver, recovery).await;
            }

            if waited {
                warn!("Clone page remained ambiguous at {url}");
                return CloneValidation::Invalid;
            }
            waited = true;
            driver.sleep(AMBIGUITY_WAIT).await;
        }
    }

    /// Direct login attempts on the cloned driver, then master recovery
    async fn login_clone_or_recover(
        &self,
        driver: &dyn Driver,
        recovery: &RecoveryCoordinator,
    ) -> CloneValidation {
        let attempts = self.config.tunables().clone_login_attempts();
        for attempt in 1..=attempts {
            match self.perform_login(driver).await {
                Ok(true) => {
                    info!("Clone re-login succeeded on attempt {attempt}");
                    return CloneValidation::Valid;
                }
                Ok(false) => debug!("Clone re-login attempt {attempt}/{attempts} rejected"),
                Err(e) => debug!("Clone re-login attempt {attempt}/{attempts} errored: {e}"),
            }
        }

        // The clone is unrecoverable; the master is likely expired too. Any
        // outcome is fine here: the job fails retriable and the next attempt
        // clones from a recovered master.
        warn!("Clone session dead after {attempts} login attempts, requesting master recovery");
        let _ = recovery.recover().await;
        CloneValidation::Invalid
    }
}
