//! reqwest-backed page fetcher.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::{is_html, FetchError, FetchResult, FetchedPage, PageFetcher, ProbeResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches pages over HTTP, following redirects.
///
/// Successful answers must be HTML; anything else is reported as
/// [`FetchError::UnsupportedContent`].
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> FetchResult<Self> {
        Self::with_timeout(user_agent, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(user_agent: &str, timeout: Duration) -> FetchResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// Use a preconfigured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request_error(url: &Url, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    fn headers(response: &Response) -> HashMap<String, String> {
        response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage> {
        debug!(url = %url, "HTTP fetch starting");
        let start = Instant::now();

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "HTTP request failed");
                Self::request_error(url, e)
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::Server {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        let headers = Self::headers(&response);

        if status.is_success() {
            if let Some(content_type) = headers.get("content-type") {
                if !is_html(content_type) {
                    return Err(FetchError::UnsupportedContent {
                        url: url.to_string(),
                        content_type: content_type.clone(),
                    });
                }
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| Self::request_error(url, e))?;

        let elapsed = start.elapsed();
        debug!(
            url = %url,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "HTTP fetch complete"
        );

        Ok(FetchedPage {
            url: url.clone(),
            final_url,
            status: status.as_u16(),
            headers,
            body,
            elapsed,
        })
    }

    async fn probe(&self, url: &Url) -> FetchResult<ProbeResult> {
        let mut response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| Self::request_error(url, e))?;

        // Some servers refuse HEAD outright
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| Self::request_error(url, e))?;
        }

        let final_url = response.url().clone();
        Ok(ProbeResult {
            status: response.status().as_u16(),
            redirected: &final_url != url,
            final_url: final_url.to_string(),
        })
    }
}
