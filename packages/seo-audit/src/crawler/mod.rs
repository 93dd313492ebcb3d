//! Breadth-first site crawler.
//!
//! A [`Crawler`] owns the fetchers and a per-host throttle; each crawl runs as
//! a [`CrawlSession`] that holds the frontier and the visited set and yields
//! pages one at a time, so callers can persist them in bounded chunks.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use url::Url;

use crate::fetch::{BrowserRenderer, FetchError, FetchResult, PageFetcher};
use crate::models::{AuditId, AuditPage, PageData};

pub mod extract;
mod session;

pub use session::CrawlSession;

pub(crate) type HostThrottle = DefaultKeyedRateLimiter<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    /// Plain HTTP fetches, following links
    #[default]
    Http,
    /// Render the root page in a scripted browser; links are not followed
    Browser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct CrawlConfig {
    #[builder(default = 30)]
    pub max_pages: usize,
    /// Links are followed up to this many hops from the root
    #[builder(default = 2)]
    pub depth_limit: usize,
    /// Visit pages on other hosts too (their links are not followed)
    #[builder(default = false)]
    pub include_external: bool,
    #[builder(default)]
    pub mode: CrawlMode,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One visited page as produced by a crawl.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawledPage {
    pub url: String,
    pub status_code: Option<u16>,
    pub depth: usize,
    pub page_data: PageData,
}

impl CrawledPage {
    pub fn into_audit_page(self, audit_id: AuditId) -> AuditPage {
        AuditPage {
            id: uuid::Uuid::now_v7(),
            audit_id,
            url: self.url,
            status_code: self.status_code,
            visited: true,
            depth: self.depth,
            page_data: self.page_data,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Counters reported when a crawl ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlSummary {
    pub pages_crawled: usize,
    pub failed_pages: usize,
    /// URLs discovered but not visited
    pub frontier_remaining: usize,
    /// Stopped at `max_pages` with URLs still queued
    pub truncated: bool,
    pub mode: CrawlMode,
}

pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    browser: Option<Arc<dyn BrowserRenderer>>,
    throttle: Arc<HostThrottle>,
}

impl Crawler {
    /// Create a crawler that makes at most `requests_per_second` requests to
    /// any single host.
    pub fn new(fetcher: Arc<dyn PageFetcher>, requests_per_second: NonZeroU32) -> Self {
        Self {
            fetcher,
            browser: None,
            throttle: Arc::new(RateLimiter::keyed(Quota::per_second(requests_per_second))),
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserRenderer>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn has_browser(&self) -> bool {
        self.browser.is_some()
    }

    pub fn fetcher(&self) -> &Arc<dyn PageFetcher> {
        &self.fetcher
    }

    /// Start a crawl of `root`.
    pub fn session(&self, root: &str, config: CrawlConfig) -> FetchResult<CrawlSession> {
        let root = parse_root(root)?;
        if config.mode == CrawlMode::Browser && self.browser.is_none() {
            return Err(FetchError::Render(
                "browser rendering is not configured".to_string(),
            ));
        }
        Ok(CrawlSession::new(
            root,
            config,
            self.fetcher.clone(),
            self.browser.clone(),
            self.throttle.clone(),
        ))
    }
}

fn parse_root(root: &str) -> FetchResult<Url> {
    let mut url =
        Url::parse(root.trim()).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", root, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(FetchError::InvalidUrl(format!(
            "{} is not an http(s) url",
            root
        )));
    }
    url.set_fragment(None);
    Ok(url)
}
