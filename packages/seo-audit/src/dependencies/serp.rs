//! SERP provider backed by an HTTP search API.
//!
//! Expects `GET {base_url}?q=...&num=...` to answer with
//! `{"organic_results": [{"position", "title", "link", "snippet"}]}`, the shape
//! common to hosted SERP APIs.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DependencyError, SerpProvider, SerpResult};

const DEPENDENCY: &str = "serp";

#[derive(Clone)]
pub struct HttpSerpProvider {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
}

#[derive(Deserialize)]
struct OrganicResult {
    position: Option<u32>,
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

impl HttpSerpProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl SerpProvider for HttpSerpProvider {
    fn name(&self) -> &str {
        DEPENDENCY
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SerpResult>, DependencyError> {
        let num = limit.to_string();
        let mut request = self
            .http_client
            .get(&self.base_url)
            .query(&[("q", query), ("num", num.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, "SERP request failed");
            DependencyError::Network {
                dependency: DEPENDENCY.to_string(),
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DependencyError::Status {
                dependency: DEPENDENCY.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SerpResponse =
            response
                .json()
                .await
                .map_err(|e| DependencyError::InvalidResponse {
                    dependency: DEPENDENCY.to_string(),
                    message: e.to_string(),
                })?;

        let results: Vec<SerpResult> = parsed
            .organic_results
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, r)| SerpResult {
                position: r.position.unwrap_or(i as u32 + 1),
                title: r.title,
                url: r.link,
                snippet: r.snippet,
            })
            .collect();

        debug!(query = %query, results = results.len(), "SERP search");
        Ok(results)
    }
}
