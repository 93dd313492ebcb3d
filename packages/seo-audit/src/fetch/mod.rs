//! Page fetching.
//!
//! [`PageFetcher`] is the plain HTTP interface, [`BrowserRenderer`] the heavier
//! scripted-browser one. Both hand back a [`FetchedPage`] or a typed
//! [`FetchError`]. [`GuardedFetcher`] adds retries and a breaker per host.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use task_guard::{CircuitError, Transient};
use thiserror::Error;
use url::Url;

mod browser;
mod guarded;
mod http;

pub use browser::RemoteBrowser;
pub use guarded::GuardedFetcher;
pub use http::HttpFetcher;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("{url} answered HTTP {status}")]
    Server { url: String, status: u16 },

    #[error("{url} answered HTTP {status}")]
    ClientStatus { url: String, status: u16 },

    #[error("{url} is not an HTML page ({content_type})")]
    UnsupportedContent { url: String, content_type: String },

    #[error("browser rendering failed: {0}")]
    Render(String),

    #[error("circuit open for {dependency}")]
    CircuitOpen { dependency: String },
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout { .. }
                | FetchError::Network { .. }
                | FetchError::Server { .. }
                | FetchError::CircuitOpen { .. }
        )
    }
}

impl From<CircuitError<FetchError>> for FetchError {
    fn from(err: CircuitError<FetchError>) -> Self {
        match err {
            CircuitError::Open { dependency } => FetchError::CircuitOpen { dependency },
            CircuitError::Inner(e) => e,
        }
    }
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: Url,
    /// URL after redirects
    pub final_url: Url,
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

impl FetchedPage {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a 4xx answer into [`FetchError::ClientStatus`].
    pub fn error_for_status(self) -> FetchResult<Self> {
        if self.status >= 400 {
            return Err(FetchError::ClientStatus {
                url: self.url.to_string(),
                status: self.status,
            });
        }
        Ok(self)
    }
}

/// Outcome of a lightweight reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: u16,
    pub final_url: String,
    pub redirected: bool,
}

/// HTTP fetch interface.
///
/// `fetch` answers with the page for 2xx to 4xx statuses and fails with
/// [`FetchError::Server`] on 5xx, so that only dependency failures are
/// retried. `probe` reports any status.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage>;

    async fn probe(&self, url: &Url) -> FetchResult<ProbeResult>;
}

/// Scripted-browser interface for pages that need JavaScript to render.
#[async_trait]
pub trait BrowserRenderer: Send + Sync {
    async fn render(&self, url: &Url) -> FetchResult<FetchedPage>;
}

pub(crate) fn is_html(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "text/html" || mime == "application/xhtml+xml"
}
