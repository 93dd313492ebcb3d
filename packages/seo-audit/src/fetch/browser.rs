//! Client for an HTTP rendering service.
//!
//! The service takes `{"url": ...}` and answers with the rendered document:
//! `{"status": 200, "final_url": "...", "html": "..."}`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{BrowserRenderer, FetchError, FetchResult, FetchedPage};

const RENDER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RemoteBrowser {
    client: Client,
    endpoint: String,
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    wait_until: &'a str,
}

#[derive(Deserialize)]
struct RenderResponse {
    status: u16,
    final_url: Option<String>,
    html: String,
}

impl RemoteBrowser {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BrowserRenderer for RemoteBrowser {
    async fn render(&self, url: &Url) -> FetchResult<FetchedPage> {
        let start = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(RENDER_TIMEOUT)
            .json(&RenderRequest {
                url: url.as_str(),
                wait_until: "networkidle",
            })
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Render request failed");
                if e.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                    }
                } else {
                    FetchError::Network {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::Server {
                url: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Render(format!("HTTP {}: {}", status, body)));
        }

        let rendered: RenderResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Render(e.to_string()))?;

        let final_url = rendered
            .final_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .unwrap_or_else(|| url.clone());

        let elapsed = start.elapsed();
        debug!(url = %url, elapsed_ms = elapsed.as_millis() as u64, "Page rendered");

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());

        Ok(FetchedPage {
            url: url.clone(),
            final_url,
            status: rendered.status,
            headers,
            body: rendered.html,
            elapsed,
        })
    }
}
