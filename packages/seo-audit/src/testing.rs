// Test doubles for the audit pipeline
//
// Scripted in-memory site, language model and SERP provider. Each one records
// its calls so tests can assert on what the pipeline actually did.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::dependencies::{DependencyError, LanguageModel, SerpProvider, SerpResult};
use crate::fetch::{BrowserRenderer, FetchError, FetchResult, FetchedPage, PageFetcher, ProbeResult};

fn normalize(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

// =============================================================================
// Mock Fetcher
// =============================================================================

#[derive(Debug, Clone)]
enum MockResponse {
    Html(String),
    Status(u16),
    Redirect(String),
}

/// An in-memory site. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockFetcher {
    pages: HashMap<String, MockResponse>,
    failures: Mutex<HashMap<String, usize>>,
    fetch_calls: Mutex<Vec<String>>,
    probe_calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `html` with status 200
    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        self.pages
            .insert(normalize(url), MockResponse::Html(html.to_string()));
        self
    }

    /// Answer with a bare status code
    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.pages.insert(normalize(url), MockResponse::Status(status));
        self
    }

    /// Answer with a redirect to `target` (probes only report it)
    pub fn with_redirect(mut self, url: &str, target: &str) -> Self {
        self.pages
            .insert(normalize(url), MockResponse::Redirect(normalize(target)));
        self
    }

    /// Fail the first `times` requests to `url` with a 503
    pub fn with_failures(self, url: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(normalize(url), times);
        self
    }

    /// Sleep before answering any request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Get every fetched URL in request order
    pub fn fetch_calls(&self) -> Vec<String> {
        self.fetch_calls.lock().unwrap().clone()
    }

    /// Get every probed URL
    pub fn probe_calls(&self) -> Vec<String> {
        self.probe_calls.lock().unwrap().clone()
    }

    /// Check if a URL was fetched
    pub fn requested(&self, url: &str) -> bool {
        self.request_count(url) > 0
    }

    pub fn request_count(&self, url: &str) -> usize {
        let url = normalize(url);
        self.fetch_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == url)
            .count()
    }

    async fn answer(&self, url: &Url) -> FetchResult<MockResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = url.to_string();
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Server {
                        url: key,
                        status: 503,
                    });
                }
            }
        }

        Ok(self
            .pages
            .get(&key)
            .cloned()
            .unwrap_or(MockResponse::Status(404)))
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage> {
        self.fetch_calls.lock().unwrap().push(url.to_string());

        let (status, body, final_url) = match self.answer(url).await? {
            MockResponse::Html(html) => (200, html, url.clone()),
            MockResponse::Status(status) if status >= 500 => {
                return Err(FetchError::Server {
                    url: url.to_string(),
                    status,
                })
            }
            MockResponse::Status(status) => (status, String::new(), url.clone()),
            MockResponse::Redirect(target) => {
                let target = Url::parse(&target).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
                let body = match self.pages.get(target.as_str()) {
                    Some(MockResponse::Html(html)) => html.clone(),
                    _ => String::new(),
                };
                (200, body, target)
            }
        };

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/html; charset=utf-8".to_string());
        Ok(FetchedPage {
            url: url.clone(),
            final_url,
            status,
            headers,
            elapsed: Duration::from_millis(120),
            body,
        })
    }

    async fn probe(&self, url: &Url) -> FetchResult<ProbeResult> {
        self.probe_calls.lock().unwrap().push(url.to_string());

        Ok(match self.answer(url).await? {
            MockResponse::Html(_) => ProbeResult {
                status: 200,
                final_url: url.to_string(),
                redirected: false,
            },
            MockResponse::Status(status) => ProbeResult {
                status,
                final_url: url.to_string(),
                redirected: false,
            },
            MockResponse::Redirect(target) => ProbeResult {
                status: 200,
                final_url: target,
                redirected: true,
            },
        })
    }
}

/// Renders through the wrapped site, recording what it was asked for.
pub struct MockBrowser {
    site: Arc<MockFetcher>,
    render_calls: Mutex<Vec<String>>,
}

impl MockBrowser {
    pub fn new(site: Arc<MockFetcher>) -> Self {
        Self {
            site,
            render_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn render_calls(&self) -> Vec<String> {
        self.render_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserRenderer for MockBrowser {
    async fn render(&self, url: &Url) -> FetchResult<FetchedPage> {
        self.render_calls.lock().unwrap().push(url.to_string());
        self.site.fetch(url).await
    }
}

// =============================================================================
// Mock Language Model
// =============================================================================

pub struct MockLanguageModel {
    responses: Mutex<Vec<Result<String, DependencyError>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a completion
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().unwrap().push(Ok(text.to_string()));
        self
    }

    /// Queue a failure
    pub fn with_error(self, error: DependencyError) -> Self {
        self.responses.lock().unwrap().push(Err(error));
        self
    }

    /// Get every prompt sent
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    fn name(&self) -> &str {
        "mock-llm"
    }

    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, DependencyError> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("- Add a meta description\n- Use a single H1 heading".to_string())
        } else {
            responses.remove(0)
        }
    }
}

// =============================================================================
// Mock SERP Provider
// =============================================================================

pub struct MockSerpProvider {
    results: Vec<SerpResult>,
    failure: Option<DependencyError>,
    queries: Mutex<Vec<String>>,
}

impl MockSerpProvider {
    pub fn new(results: Vec<SerpResult>) -> Self {
        Self {
            results,
            failure: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Provider that always fails with `error`
    pub fn failing(error: DependencyError) -> Self {
        Self {
            results: Vec::new(),
            failure: Some(error),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SerpProvider for MockSerpProvider {
    fn name(&self) -> &str {
        "mock-serp"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SerpResult>, DependencyError> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(self.results.iter().take(limit).cloned().collect())
    }
}
