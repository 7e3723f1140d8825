//! Network transport for image downloads.
//!
//! - [`Transport`] opens a URL and yields a streaming [`Body`]
//! - [`HttpTransport`] is the reqwest implementation: one attempt, bounded
//!   redirects, request timeout, fixed User-Agent
//!
//! Status handling and size limits live in the pipeline, so every transport
//! is held to the same rules.

pub mod url;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;

pub use url::{UrlError, parse_image_url};

use pixstash_core::{AppConfig, Error};

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "pixstash/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "pixstash/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
        }
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            ..Self::default()
        }
    }
}

/// An opened response.
#[async_trait]
pub trait Body: Send {
    fn status(&self) -> u16;

    /// Declared length, if the server sent one.
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body; `None` at the end.
    async fn chunk(&mut self) -> Result<Option<Bytes>, Error>;
}

/// Opens URLs for download.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &::url::Url) -> Result<Box<dyn Body>, Error>;
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    config: FetchConfig,
}

impl HttpTransport {
    /// Create a new transport with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &::url::Url) -> Result<Box<dyn Body>, Error> {
        let response = self
            .http
            .get(url.as_str())
            .header("Accept", "image/*,*/*;q=0.8")
            .send()
            .await
            .map_err(|e| Error::Transport(format!("network error: {e}")))?;

        tracing::debug!(%url, status = response.status().as_u16(), final_url = %response.url(), "Opened response");
        Ok(Box::new(HttpBody(response)))
    }
}

struct HttpBody(reqwest::Response);

#[async_trait]
impl Body for HttpBody {
    fn status(&self) -> u16 {
        self.0.status().as_u16()
    }

    fn content_length(&self) -> Option<u64> {
        self.0.content_length()
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        self.0
            .chunk()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response: {e}")))
    }
}
