//! Browser provider abstraction
//!
//! The orchestration core drives browsers through the [`Driver`] trait and
//! obtains them through a [`BrowserProvider`]. A single driver handle is used
//! by a single logical task at a time; no further thread-safety is assumed.
//! The production implementation lives in [`chromium`].

pub mod chromium;

pub use chromium::{ChromiumDriver, ChromiumProvider};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;

/// Launch options shared by master and clone browsers
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub window_size: (u32, u32),
    pub request_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: (1920, 1080),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A live browser bound to one profile directory.
///
/// Dropping a driver must tear the browser process down; the explicit
/// [`shutdown`](Self::shutdown) path is the graceful variant used on normal
/// exits.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Navigate the driver's page to `url` and wait for the load to settle
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// True when an element matching `selector` is present
    async fn find(&self, selector: &str) -> Result<bool, DriverError>;

    /// Focus the element matching `selector` and type `text` into it
    async fn type_into(&self, selector: &str, text: &str) -> Result<(), DriverError>;

    /// Click the element matching `selector`
    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    /// PNG screenshot of the element matching `selector`
    async fn element_screenshot(&self, selector: &str) -> Result<Vec<u8>, DriverError>;

    /// PNG screenshot of the full page
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// URL the page currently shows; doubles as the cheap liveness probe
    async fn current_url(&self) -> Result<String, DriverError>;

    /// Pause this driver's task, e.g. while a page settles
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Graceful shutdown: close the browser and wait for the process to exit
    async fn shutdown(self: Box<Self>);
}

/// Opaque factory launching a browser bound to a profile directory
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn launch(
        &self,
        user_data_dir: &Path,
        options: &LaunchOptions,
    ) -> Result<Box<dyn Driver>, DriverError>;
}
