//! Chromium-backed implementation of the driver traits
//!
//! Launches Chrome/Chromium via chromiumoxide against a caller-supplied
//! profile directory and keeps the CDP handler task tied to the driver's
//! lifetime.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use super::{BrowserProvider, Driver, LaunchOptions};
use crate::error::DriverError;

/// Find a Chrome/Chromium executable on the system.
///
/// `CHROMIUM_PATH` overrides everything; otherwise well-known install paths
/// are probed and `which` is consulted as a last resort.
pub fn find_browser_executable() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from CHROMIUM_PATH: {}", path.display());
            return Some(path);
        }
        warn!(
            "CHROMIUM_PATH points to non-existent file: {}",
            path.display()
        );
    }

    let paths: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Found browser at: {}", path.display());
            return Some(path);
        }
    }

    for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
        if let Ok(output) = Command::new("which").arg(cmd).output()
            && output.status.success()
        {
            let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path_str.is_empty() {
                let path = PathBuf::from(path_str);
                info!("Found browser using 'which': {}", path.display());
                return Some(path);
            }
        }
    }

    None
}

/// Download a managed Chromium build into a cache directory.
async fn download_managed_browser() -> Result<PathBuf, DriverError> {
    info!("No system browser found, downloading managed Chromium");

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("formflow")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir)
        .map_err(|e| DriverError::Launch(format!("failed to create browser cache dir: {e}")))?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .map_err(|e| DriverError::Launch(format!("failed to build fetcher options: {e}")))?,
    );

    let revision_info = fetcher
        .fetch()
        .await
        .map_err(|e| DriverError::Launch(format!("failed to fetch browser: {e}")))?;

    info!(
        "Downloaded Chromium to: {}",
        revision_info.folder_path.display()
    );
    Ok(revision_info.executable_path)
}

// =============================================================================
// ChromiumProvider
// =============================================================================

/// Production [`BrowserProvider`] launching Chromium against a profile dir
#[derive(Debug, Default)]
pub struct ChromiumProvider;

impl ChromiumProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserProvider for ChromiumProvider {
    async fn launch(
        &self,
        user_data_dir: &Path,
        options: &LaunchOptions,
    ) -> Result<Box<dyn Driver>, DriverError> {
        let chrome_path = match find_browser_executable() {
            Some(path) => path,
            None => download_managed_browser().await?,
        };

        std::fs::create_dir_all(user_data_dir)
            .map_err(|e| DriverError::Launch(format!("failed to create user data dir: {e}")))?;

        let mut config_builder = BrowserConfigBuilder::default()
            .request_timeout(options.request_timeout)
            .window_size(options.window_size.0, options.window_size.1)
            .user_data_dir(user_data_dir)
            .chrome_executable(chrome_path);

        if options.headless {
            config_builder = config_builder.headless_mode(HeadlessMode::default());
        } else {
            config_builder = config_builder.with_head();
        }

        config_builder = config_builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--disable-background-networking")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--disable-prompt-on-repost")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--password-store=basic")
            .arg("--use-mock-keychain")
            .arg("--metrics-recording-only")
            .arg("--mute-audio");

        let browser_config = config_builder
            .build()
            .map_err(|e| DriverError::Launch(format!("failed to build browser config: {e}")))?;

        debug!(
            "Launching browser with profile {}",
            user_data_dir.display()
        );
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let handler_task = task::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    let msg = e.to_string();
                    // Chrome sends CDP events chromiumoxide doesn't recognise;
                    // those deserialization misses are not actionable.
                    let benign = msg
                        .contains("data did not match any variant of untagged enum Message")
                        || msg.contains("Failed to deserialize WS response");
                    if benign {
                        trace!("Suppressed benign CDP serialization error: {msg}");
                    } else {
                        error!("Browser handler error: {msg}");
                    }
                }
            }
            debug!("Browser handler task completed");
        });

        Ok(Box::new(ChromiumDriver {
            browser: Mutex::new(Some(browser)),
            page: Mutex::new(None),
            handler: handler_task,
        }))
    }
}

// =============================================================================
// ChromiumDriver
// =============================================================================

/// One Chromium instance plus its CDP handler task.
///
/// A single page is lazily created on first navigation and reused; the core
/// never needs more than one page per driver.
pub struct ChromiumDriver {
    browser: Mutex<Option<Browser>>,
    page: Mutex<Option<Page>>,
    handler: JoinHandle<()>,
}

impl ChromiumDriver {
    async fn page(&self) -> Result<Page, DriverError> {
        let mut guard = self.page.lock().await;
        if let Some(page) = guard.as_ref() {
            return Ok(page.clone());
        }

        let browser = self.browser.lock().await;
        let browser = browser
            .as_ref()
            .ok_or_else(|| DriverError::Connection("browser already shut down".to_string()))?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Connection(format!("failed to create page: {e}")))?;
        *guard = Some(page.clone());
        Ok(page)
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let page = self.page().await?;
        page.goto(url).await.map_err(|e| DriverError::Navigation {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        page.wait_for_navigation()
            .await
            .map_err(|e| DriverError::Navigation {
                url: url.to_string(),
                message: format!("load did not settle: {e}"),
            })?;
        Ok(())
    }

    async fn find(&self, selector: &str) -> Result<bool, DriverError> {
        let page = self.page().await?;
        match page.find_element(selector).await {
            Ok(_) => Ok(true),
            Err(e) => {
                trace!("find `{selector}`: {e}");
                Ok(false)
            }
        }
    }

    async fn type_into(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        let page = self.page().await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| DriverError::Dom {
                selector: selector.to_string(),
                message: e.to_string(),
            })?;
        element.click().await.map_err(|e| DriverError::Dom {
            selector: selector.to_string(),
            message: format!("focus failed: {e}"),
        })?;
        element.type_str(text).await.map_err(|e| DriverError::Dom {
            selector: selector.to_string(),
            message: format!("typing failed: {e}"),
        })?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let page = self.page().await?;
        page.find_element(selector)
            .await
            .map_err(|e| DriverError::Dom {
                selector: selector.to_string(),
                message: e.to_string(),
            })?
            .click()
            .await
            .map_err(|e| DriverError::Dom {
                selector: selector.to_string(),
                message: format!("click failed: {e}"),
            })?;
        Ok(())
    }

    async fn element_screenshot(&self, selector: &str) -> Result<Vec<u8>, DriverError> {
        let page = self.page().await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| DriverError::Dom {
                selector: selector.to_string(),
                message: e.to_string(),
            })?;
        element
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| DriverError::Screenshot(e.to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let page = self.page().await?;
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            capture_beyond_viewport: Some(true),
            ..Default::default()
        };
        page.screenshot(params)
            .await
            .map_err(|e| DriverError::Screenshot(e.to_string()))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let page = self.page().await?;
        page.url()
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?
            .ok_or_else(|| DriverError::Connection("page has no URL".to_string()))
    }

    async fn shutdown(self: Box<Self>) {
        // Close gracefully, wait for the process, then stop the handler.
        // Order matters: the handler drives the CDP connection the close
        // command travels on.
        let mut browser_guard = self.browser.lock().await;
        if let Some(mut browser) = browser_guard.take() {
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {e}");
            }
            if let Err(e) = browser.wait().await {
                warn!("Failed to wait for browser exit: {e}");
            }
        }
        drop(browser_guard);
        self.handler.abort();
    }
}

impl Drop for ChromiumDriver {
    fn drop(&mut self) {
        // Cancellation path: Browser::drop kills the Chrome process, the
        // handler just needs to stop pumping events.
        self.handler.abort();
    }
}
