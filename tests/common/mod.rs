//! Shared test doubles: scripted drivers, providers, form fillers and
//! collaborator fakes, plus helpers that assemble a full executor stack on a
//! temp directory.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;

use formflow::{
    BlobStore, BrowserProvider, CaptchaSolver, Driver, DriverError, FormFiller, FormOutcome,
    LaunchOptions, PortalConfig, PortalConfigBuilder, PortalSelectors,
};

// =============================================================================
// FakeDriver
// =============================================================================

/// What the fake page currently shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Dashboard,
    LoginPage,
    Blank,
}

type LoginCallback = Arc<dyn Fn() + Send + Sync>;

/// Scripted driver: sentinel lookups answer from a page state, a successful
/// login submit moves the page to the dashboard.
pub struct FakeDriver {
    state: Arc<StdMutex<PageState>>,
    selectors: PortalSelectors,
    /// Failed login submits remaining before one succeeds; `u32::MAX` = never
    logins_until_success: AtomicU32,
    responsive: Arc<AtomicBool>,
    on_login: Option<LoginCallback>,
}

impl FakeDriver {
    pub fn new(initial: PageState) -> Self {
        Self {
            state: Arc::new(StdMutex::new(initial)),
            selectors: PortalSelectors::default(),
            logins_until_success: AtomicU32::new(0),
            responsive: Arc::new(AtomicBool::new(true)),
            on_login: None,
        }
    }

    /// Reject the next `n` login submits before letting one through
    pub fn with_login_failures(self, n: u32) -> Self {
        self.logins_until_success.store(n, Ordering::SeqCst);
        self
    }

    /// Run `callback` when a login submit reaches the dashboard
    pub fn with_on_login(mut self, callback: LoginCallback) -> Self {
        self.on_login = Some(callback);
        self
    }

    /// Share page state with the test so it can flip mid-scenario
    pub fn with_shared_state(mut self, state: Arc<StdMutex<PageState>>) -> Self {
        self.state = state;
        self
    }

    /// Share the liveness flag so the test can kill the driver
    pub fn with_responsiveness(mut self, flag: Arc<AtomicBool>) -> Self {
        self.responsive = flag;
        self
    }

    /// Handle that can flip the driver dead from outside
    pub fn responsiveness_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.responsive)
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn navigate(&self, _url: &str) -> Result<(), DriverError> {
        if !self.responsive.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("driver dead".to_string()));
        }
        Ok(())
    }

    async fn find(&self, selector: &str) -> Result<bool, DriverError> {
        let state = *self.state.lock().expect("state lock");
        let present = match state {
            PageState::Dashboard => selector == self.selectors.dashboard_marker,
            PageState::LoginPage => {
                selector == self.selectors.login_form_marker
                    || selector == self.selectors.captcha_image
            }
            PageState::Blank => false,
        };
        Ok(present)
    }

    async fn type_into(&self, _selector: &str, _text: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("state lock");
        if selector == self.selectors.submit_button && *state == PageState::LoginPage {
            let remaining = self.logins_until_success.load(Ordering::SeqCst);
            if remaining == 0 {
                *state = PageState::Dashboard;
                if let Some(callback) = &self.on_login {
                    callback();
                }
            } else if remaining != u32::MAX {
                self.logins_until_success.store(remaining - 1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn element_screenshot(&self, _selector: &str) -> Result<Vec<u8>, DriverError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        if !self.responsive.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("driver dead".to_string()));
        }
        let state = *self.state.lock().expect("state lock");
        Ok(match state {
            PageState::Dashboard => "https://portal.test/home".to_string(),
            PageState::LoginPage => "https://portal.test/login".to_string(),
            PageState::Blank => "about:blank".to_string(),
        })
    }

    async fn shutdown(self: Box<Self>) {}
}

// =============================================================================
// FakeProvider
// =============================================================================

type DriverScript = Box<dyn Fn(usize) -> Box<dyn Driver> + Send + Sync>;

/// Provider whose `launch` hands out drivers from a script keyed by launch
/// index, recording every profile directory it was asked to launch against.
pub struct FakeProvider {
    script: DriverScript,
    launches: AtomicUsize,
    launch_dirs: StdMutex<Vec<PathBuf>>,
}

impl FakeProvider {
    pub fn new(script: DriverScript) -> Self {
        Self {
            script,
            launches: AtomicUsize::new(0),
            launch_dirs: StdMutex::new(Vec::new()),
        }
    }

    /// Every launch gets an identical fresh driver
    pub fn uniform(factory: impl Fn() -> FakeDriver + Send + Sync + 'static) -> Self {
        Self::new(Box::new(move |_| Box::new(factory())))
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// How many launches targeted the given profile directory
    pub fn launches_against(&self, dir: &Path) -> usize {
        self.launch_dirs
            .lock()
            .expect("launch dirs lock")
            .iter()
            .filter(|d| d.as_path() == dir)
            .count()
    }
}

#[async_trait]
impl BrowserProvider for FakeProvider {
    async fn launch(
        &self,
        user_data_dir: &Path,
        _options: &LaunchOptions,
    ) -> Result<Box<dyn Driver>, DriverError> {
        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        self.launch_dirs
            .lock()
            .expect("launch dirs lock")
            .push(user_data_dir.to_path_buf());
        Ok((self.script)(index))
    }
}

// =============================================================================
// Collaborator fakes
// =============================================================================

/// OCR that always reads the same text
pub struct FixedSolver;

#[async_trait]
impl CaptchaSolver for FixedSolver {
    async fn ocr(&self, _image: &[u8]) -> anyhow::Result<String> {
        Ok("XK42".to_string())
    }
}

/// Records every upload and returns a deterministic URL
#[derive(Default)]
pub struct MemoryBlobStore {
    pub uploads: StdMutex<Vec<String>>,
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, _bytes: Vec<u8>, key: &str) -> anyhow::Result<String> {
        self.uploads
            .lock()
            .expect("uploads lock")
            .push(key.to_string());
        Ok(format!("https://blobs.test/{key}"))
    }
}

// =============================================================================
// ScriptedFormFiller
// =============================================================================

/// Form filler that pops one scripted outcome per invocation and tracks the
/// concurrency high-water mark.
pub struct ScriptedFormFiller {
    outcomes: StdMutex<VecDeque<FormOutcome>>,
    /// When the script runs dry: pend forever (for deadline tests) or succeed
    hang_when_empty: bool,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

impl ScriptedFormFiller {
    pub fn new(outcomes: Vec<FormOutcome>) -> Self {
        Self {
            outcomes: StdMutex::new(outcomes.into()),
            hang_when_empty: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Never returns: used to exercise the job deadline
    pub fn hanging() -> Self {
        let mut filler = Self::new(Vec::new());
        filler.hang_when_empty = true;
        filler
    }

    pub fn always_success() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl FormFiller for ScriptedFormFiller {
    async fn fill_and_submit(
        &self,
        _driver: &dyn Driver,
        _form_data: &serde_json::Value,
    ) -> anyhow::Result<FormOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let next = self.outcomes.lock().expect("outcomes lock").pop_front();
        let outcome = match next {
            Some(outcome) => outcome,
            None if self.hang_when_empty => {
                // Hold the in-flight count; the job deadline reaps us
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => FormOutcome::success(),
        };

        // Let concurrent jobs overlap so the high-water mark means something
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

// =============================================================================
// Config helpers
// =============================================================================

/// Portal config on a temp root with test-friendly tunables: instant retry
/// and zero idle poll. `customize` tweaks the builder per scenario.
pub fn test_portal_config_with(
    root: &Path,
    customize: impl FnOnce(PortalConfigBuilder) -> PortalConfigBuilder,
) -> PortalConfig {
    let master = root.join("master");
    std::fs::create_dir_all(master.join("Default")).expect("master profile dir");
    std::fs::write(master.join("Default/Preferences"), b"{}").expect("seed master profile");

    let builder = PortalConfigBuilder::new(
        "acme",
        "https://portal.test/entry",
        master,
        root.join("clones"),
    )
    .dashboard_url("https://portal.test/home")
    .credentials("agent", "secret")
    .retry_backoff_secs(0)
    .idle_poll_secs(0);

    customize(builder).build()
}

pub fn test_portal_config(root: &Path) -> PortalConfig {
    test_portal_config_with(root, |builder| builder)
}
