//! Core configuration types for the orchestrator
//!
//! This module contains the process-level `OrchestratorConfig` and the
//! per-portal `PortalConfig` with its DOM selector set and tunables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Process-level configuration: one queue database, one optional status API
/// listener, and one or more portal instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Path of the SQLite queue database
    pub(crate) queue_db_path: PathBuf,

    /// Path of the SQLite intake database holding the upstream document
    /// collection. Defaults to the queue database when absent.
    #[serde(default)]
    pub(crate) intake_db_path: Option<PathBuf>,

    /// Listen address for the read-only status API; disabled when absent
    #[serde(default)]
    pub(crate) status_api_addr: Option<SocketAddr>,

    /// Endpoint of the CAPTCHA OCR collaborator
    #[serde(default)]
    pub(crate) ocr_endpoint: Option<String>,

    /// Endpoint of the screenshot blob-store collaborator
    #[serde(default)]
    pub(crate) blob_endpoint: Option<String>,

    /// Portal instances, keyed by the ingest discriminator in `name`
    pub(crate) portals: Vec<PortalConfig>,
}

/// Configuration for one vendor portal instance.
///
/// Immutable after process start; credentials never leave this struct except
/// through the login probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Discriminator value routed from the ingest payload (e.g. `"company"`)
    pub(crate) name: String,
    pub(crate) entry_url: String,
    pub(crate) dashboard_url: String,
    pub(crate) username: String,
    pub(crate) password: String,

    /// Master profile directory; exclusively owned by the master session
    pub(crate) master_profile_path: PathBuf,

    /// Root under which per-job clone directories are created
    pub(crate) clone_root: PathBuf,

    #[serde(default = "default_headless")]
    pub(crate) headless: bool,

    #[serde(default)]
    pub(crate) selectors: PortalSelectors,

    #[serde(default)]
    pub(crate) tunables: Tunables,
}

fn default_headless() -> bool {
    true
}

/// CSS selectors identifying the portal's sentinel elements.
///
/// The dashboard marker and login-form marker are the polymorphic
/// logged-in/logged-out probes; the rest drive the login form itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSelectors {
    pub dashboard_marker: String,
    pub login_form_marker: String,
    pub username_field: String,
    pub password_field: String,
    pub captcha_image: String,
    pub captcha_field: String,
    pub submit_button: String,
    /// URL path fragment identifying the login page
    pub login_path: String,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            dashboard_marker: "#dashboard".to_string(),
            login_form_marker: "form#login".to_string(),
            username_field: "input[name=username]".to_string(),
            password_field: "input[name=password]".to_string(),
            captcha_image: "img.captcha".to_string(),
            captcha_field: "input[name=captcha]".to_string(),
            submit_button: "button[type=submit]".to_string(),
            login_path: "/login".to_string(),
        }
    }
}

/// Numeric tunables. Durations are stored as plain seconds and exposed as
/// `Duration` through the getter methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    /// Maximum jobs in flight at once
    pub(crate) max_parallel: usize,

    /// Hard per-job deadline in seconds
    pub(crate) job_timeout_secs: u64,

    /// Flat delay in seconds before a retriable job is eligible again
    pub(crate) retry_backoff_secs: u64,

    /// Dispatch budget per job
    pub(crate) max_attempts: u32,

    /// Age in seconds past which an `is_active` flag is treated as unknown
    pub(crate) stale_horizon_secs: u64,

    /// Recovery ladder budgets, consumed in order and reset on any success
    pub(crate) soft_max: u32,
    pub(crate) hard_max: u32,
    pub(crate) nuclear_max: u32,

    /// Files larger than this are skipped when cloning a profile (caches)
    pub(crate) clone_file_skip_size: u64,

    /// Deadline in seconds for one login attempt
    pub(crate) login_timeout_secs: u64,

    /// Deadline in seconds for a session freshness check
    pub(crate) check_timeout_secs: u64,

    /// Direct login attempts on a cloned driver before declaring it invalid
    pub(crate) clone_login_attempts: u32,

    /// Scheduler sleep in seconds when the queue is empty
    pub(crate) idle_poll_secs: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            job_timeout_secs: 300,
            retry_backoff_secs: 60,
            max_attempts: 3,
            stale_horizon_secs: 120,
            soft_max: 3,
            hard_max: 2,
            nuclear_max: 1,
            clone_file_skip_size: 25 * 1024 * 1024,
            login_timeout_secs: 45,
            check_timeout_secs: 15,
            clone_login_attempts: 3,
            idle_poll_secs: 2,
        }
    }
}
