//! External capability seams: CAPTCHA OCR and screenshot blob storage
//!
//! The core only consumes these through the traits; the HTTP implementations
//! talk JSON with base64-encoded image payloads.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::debug;

/// Resolves a CAPTCHA image to its text
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn ocr(&self, image: &[u8]) -> anyhow::Result<String>;
}

/// Stores failure screenshots and returns a stable URL
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> anyhow::Result<String>;
}

// =============================================================================
// HTTP implementations
// =============================================================================

#[derive(Deserialize)]
struct OcrResponse {
    text: String,
}

/// OCR collaborator speaking `POST {endpoint} {"image": <base64>}`
pub struct HttpCaptchaSolver {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCaptchaSolver {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CaptchaSolver for HttpCaptchaSolver {
    async fn ocr(&self, image: &[u8]) -> anyhow::Result<String> {
        let body = serde_json::json!({ "image": BASE64.encode(image) });
        let response: OcrResponse = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("OCR resolved {} bytes to {} chars", image.len(), response.text.len());
        Ok(response.text.trim().to_string())
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

/// Blob-store collaborator speaking `POST {endpoint} {"key": ..., "data": <base64>}`
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBlobStore {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({ "key": key, "data": BASE64.encode(&bytes) });
        let response: UploadResponse = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Uploaded {} bytes as {key} -> {}", bytes.len(), response.url);
        Ok(response.url)
    }
}
