use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::stream::{self, Stream};
use tracing::{debug, warn};
use url::Url;

use super::extract::extract_page;
use super::{CrawlConfig, CrawlMode, CrawlSummary, CrawledPage, HostThrottle};
use crate::fetch::{BrowserRenderer, FetchError, FetchResult, FetchedPage, PageFetcher};
use crate::models::PageData;

/// State of one crawl: the frontier of `(url, depth)` pairs still to visit
/// and every URL ever enqueued. A URL is marked seen when it is enqueued, so
/// no URL is fetched twice.
pub struct CrawlSession {
    root: Url,
    site_host: String,
    config: CrawlConfig,
    fetcher: Arc<dyn PageFetcher>,
    browser: Option<Arc<dyn BrowserRenderer>>,
    throttle: Arc<HostThrottle>,
    frontier: VecDeque<(Url, usize)>,
    seen: HashSet<String>,
    pages_crawled: usize,
    failed_pages: usize,
    finished: bool,
}

impl CrawlSession {
    pub(super) fn new(
        root: Url,
        mut config: CrawlConfig,
        fetcher: Arc<dyn PageFetcher>,
        browser: Option<Arc<dyn BrowserRenderer>>,
        throttle: Arc<HostThrottle>,
    ) -> Self {
        config.max_pages = config.max_pages.max(1);
        let site_host = root.host_str().unwrap_or_default().to_string();
        let mut seen = HashSet::new();
        seen.insert(root.to_string());
        let mut frontier = VecDeque::new();
        frontier.push_back((root.clone(), 0));

        Self {
            root,
            site_host,
            config,
            fetcher,
            browser,
            throttle,
            frontier,
            seen,
            pages_crawled: 0,
            failed_pages: 0,
            finished: false,
        }
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    pub fn pages_crawled(&self) -> usize {
        self.pages_crawled
    }

    pub fn frontier_len(&self) -> usize {
        self.frontier.len()
    }

    /// Visit the next page.
    ///
    /// Returns `None` once the frontier is empty or `max_pages` pages have been
    /// visited. A failure on the root page is returned as an error and ends
    /// the crawl; failures on other pages are recorded on the page itself.
    pub async fn next_page(&mut self) -> Option<FetchResult<CrawledPage>> {
        if self.finished || self.pages_crawled >= self.config.max_pages {
            return None;
        }
        let (url, depth) = self.frontier.pop_front()?;
        let is_root = self.pages_crawled == 0;

        if let Some(host) = url.host_str() {
            self.throttle.until_key_ready(&host.to_string()).await;
        }

        let result = match self.config.mode {
            CrawlMode::Http => self.fetcher.fetch(&url).await,
            CrawlMode::Browser => {
                // Rendering is expensive; only the root is rendered
                self.finished = true;
                self.frontier.clear();
                match &self.browser {
                    Some(browser) => browser.render(&url).await,
                    None => Err(FetchError::Render(
                        "browser rendering is not configured".to_string(),
                    )),
                }
            }
        };

        let fetched = match result.and_then(|page| {
            if is_root {
                page.error_for_status()
            } else {
                Ok(page)
            }
        }) {
            Ok(page) => page,
            Err(err) if is_root => {
                warn!(url = %url, error = %err, "Root page could not be fetched");
                self.finished = true;
                self.frontier.clear();
                return Some(Err(err));
            }
            Err(err) => {
                warn!(url = %url, error = %err, "Page fetch failed");
                self.pages_crawled += 1;
                self.failed_pages += 1;
                let status_code = match &err {
                    FetchError::Server { status, .. } | FetchError::ClientStatus { status, .. } => {
                        Some(*status)
                    }
                    _ => None,
                };
                return Some(Ok(CrawledPage {
                    url: url.to_string(),
                    status_code,
                    depth,
                    page_data: PageData {
                        error: Some(err.to_string()),
                        ..Default::default()
                    },
                }));
            }
        };

        self.pages_crawled += 1;
        if is_root {
            // Follow the site to wherever the root redirected
            if let Some(host) = fetched.final_url.host_str() {
                self.site_host = host.to_string();
            }
        }
        Some(Ok(self.visit(url, depth, fetched)))
    }

    fn visit(&mut self, url: Url, depth: usize, fetched: FetchedPage) -> CrawledPage {
        if fetched.status >= 400 {
            self.failed_pages += 1;
            return CrawledPage {
                url: url.to_string(),
                status_code: Some(fetched.status),
                depth,
                page_data: PageData {
                    error: Some(format!("HTTP {}", fetched.status)),
                    ..Default::default()
                },
            };
        }

        let page_data = extract_page(&fetched.body, &fetched.final_url);
        let internal = fetched.final_url.host_str() == Some(self.site_host.as_str());

        if internal && depth < self.config.depth_limit && !self.finished {
            let mut queued = 0usize;
            for link in &page_data.links {
                let Ok(next) = Url::parse(&link.url) else {
                    continue;
                };
                let same_site = next.host_str() == Some(self.site_host.as_str());
                if !same_site && !self.config.include_external {
                    continue;
                }
                if self.seen.insert(next.to_string()) {
                    self.frontier.push_back((next, depth + 1));
                    queued += 1;
                }
            }
            debug!(url = %url, depth, queued, frontier = self.frontier.len(), "Page crawled");
        } else {
            debug!(url = %url, depth, "Page crawled (links not followed)");
        }

        CrawledPage {
            url: url.to_string(),
            status_code: Some(fetched.status),
            depth,
            page_data,
        }
    }

    /// Pages as a stream, for chunked consumption.
    pub fn pages(&mut self) -> impl Stream<Item = FetchResult<CrawledPage>> + '_ {
        stream::unfold(self, |session| async move {
            let page = session.next_page().await?;
            Some((page, session))
        })
    }

    pub fn summary(&self) -> CrawlSummary {
        CrawlSummary {
            pages_crawled: self.pages_crawled,
            failed_pages: self.failed_pages,
            frontier_remaining: self.frontier.len(),
            truncated: self.pages_crawled >= self.config.max_pages && !self.frontier.is_empty(),
            mode: self.config.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use futures::StreamExt;

    use super::*;
    use crate::crawler::Crawler;
    use crate::testing::MockFetcher;

    fn site() -> MockFetcher {
        MockFetcher::new()
            .with_page(
                "https://example.com/",
                r#"<title>Home</title><a href="/a">A</a><a href="/b">B</a><a href="https://other.org/">O</a>"#,
            )
            .with_page(
                "https://example.com/a",
                r#"<title>A</title><a href="/">Home</a><a href="/a/deep">Deep</a>"#,
            )
            .with_page("https://example.com/b", "<title>B</title>")
            .with_page("https://example.com/a/deep", "<title>Deep</title>")
    }

    fn crawler(fetcher: Arc<MockFetcher>) -> Crawler {
        Crawler::new(fetcher, NonZeroU32::new(1000).unwrap())
    }

    #[tokio::test]
    async fn test_breadth_first_within_limits() {
        let fetcher = Arc::new(site());
        let crawler = crawler(fetcher.clone());
        let mut session = crawler
            .session("https://example.com/", CrawlConfig::builder().depth_limit(1).build())
            .unwrap();

        let pages: Vec<_> = session.pages().collect().await;
        let urls: Vec<_> = pages
            .iter()
            .map(|p| p.as_ref().unwrap().url.clone())
            .collect();

        assert_eq!(
            urls,
            vec!["https://example.com/", "https://example.com/a", "https://example.com/b"]
        );
        // Depth 1 pages are visited but /a/deep is never queued
        assert!(!fetcher.requested("https://example.com/a/deep"));
        assert!(!fetcher.requested("https://other.org/"));

        let summary = session.summary();
        assert_eq!(summary.pages_crawled, 3);
        assert!(!summary.truncated);
    }

    #[tokio::test]
    async fn test_max_pages_truncates_without_revisits() {
        let fetcher = Arc::new(site());
        let crawler = crawler(fetcher.clone());
        let mut session = crawler
            .session("https://example.com/", CrawlConfig::builder().max_pages(2).build())
            .unwrap();

        let pages: Vec<_> = session.pages().collect().await;
        assert_eq!(pages.len(), 2);

        let summary = session.summary();
        assert!(summary.truncated);
        // /b and /a/deep are still queued
        assert_eq!(summary.frontier_remaining, 2);
        assert_eq!(fetcher.request_count("https://example.com/"), 1);
    }

    #[tokio::test]
    async fn test_root_failure_ends_crawl() {
        let fetcher = Arc::new(MockFetcher::new().with_status("https://example.com/", 404));
        let crawler = crawler(fetcher);
        let mut session = crawler
            .session("https://example.com/", CrawlConfig::default())
            .unwrap();

        let first = session.next_page().await.unwrap();
        assert!(matches!(first, Err(FetchError::ClientStatus { status: 404, .. })));
        assert!(session.next_page().await.is_none());
    }

    #[tokio::test]
    async fn test_broken_child_is_recorded_not_fatal() {
        let fetcher = Arc::new(
            MockFetcher::new()
                .with_page("https://example.com/", r#"<a href="/gone">Gone</a>"#)
                .with_status("https://example.com/gone", 404),
        );
        let crawler = crawler(fetcher);
        let mut session = crawler
            .session("https://example.com/", CrawlConfig::default())
            .unwrap();

        let pages: Vec<_> = session.pages().collect().await;
        let gone = pages[1].as_ref().unwrap();
        assert_eq!(gone.status_code, Some(404));
        assert!(gone.page_data.error.is_some());
        assert_eq!(session.summary().failed_pages, 1);
    }

    #[tokio::test]
    async fn test_external_pages_visited_when_requested() {
        let fetcher = Arc::new(
            site().with_page("https://other.org/", r#"<a href="/more">More</a>"#),
        );
        let crawler = crawler(fetcher.clone());
        let mut session = crawler
            .session(
                "https://example.com/",
                CrawlConfig::builder().depth_limit(1).include_external(true).build(),
            )
            .unwrap();

        let _: Vec<_> = session.pages().collect().await;
        assert!(fetcher.requested("https://other.org/"));
        assert!(!fetcher.requested("https://other.org/more"));
    }

    #[tokio::test]
    async fn test_browser_mode_requires_renderer() {
        let crawler = crawler(Arc::new(site()));
        let result = crawler.session(
            "https://example.com/",
            CrawlConfig::builder().mode(CrawlMode::Browser).build(),
        );
        assert!(matches!(result, Err(FetchError::Render(_))));
    }
}
