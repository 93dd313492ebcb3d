use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::{crawled_pages, encode};
use crate::error::{AuditError, AuditResult};
use crate::fetch::{FetchError, PageFetcher};
use crate::models::{StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

/// Links checked at once against a single host.
const PER_HOST_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum LinkPriority {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct LinkCheck {
    url: String,
    /// First page the link was found on
    source: String,
    external: bool,
    status_code: Option<u16>,
    is_redirect: bool,
    final_url: Option<String>,
    error: Option<String>,
    priority: LinkPriority,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkStats {
    total: usize,
    ok: usize,
    redirect: usize,
    broken: usize,
    internal: usize,
    external: usize,
    hosts: usize,
    link_checker: Vec<LinkCheck>,
}

/// Probes every link found on the crawled pages.
///
/// Links are grouped by host; hosts are checked concurrently and links within
/// one host a few at a time. A link that cannot be reached is recorded as an
/// error on that link and never fails the stage. External links are only
/// probed with `{"checkExternal": true}`.
pub struct LinksStage {
    fetcher: Arc<dyn PageFetcher>,
    per_host_concurrency: usize,
}

impl LinksStage {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            per_host_concurrency: PER_HOST_CONCURRENCY,
        }
    }

    pub fn with_per_host_concurrency(mut self, limit: usize) -> Self {
        self.per_host_concurrency = limit.max(1);
        self
    }

    async fn check(&self, url: Url, source: String, external: bool) -> LinkCheck {
        match self.fetcher.probe(&url).await {
            Ok(probe) => {
                let priority = if probe.status >= 400 {
                    LinkPriority::Error
                } else if probe.redirected {
                    LinkPriority::Warning
                } else {
                    LinkPriority::Ok
                };
                LinkCheck {
                    url: url.to_string(),
                    source,
                    external,
                    status_code: Some(probe.status),
                    is_redirect: probe.redirected,
                    final_url: probe.redirected.then_some(probe.final_url),
                    error: None,
                    priority,
                }
            }
            Err(err) => {
                let status_code = match &err {
                    FetchError::Server { status, .. } | FetchError::ClientStatus { status, .. } => {
                        Some(*status)
                    }
                    _ => None,
                };
                LinkCheck {
                    url: url.to_string(),
                    source,
                    external,
                    status_code,
                    is_redirect: false,
                    final_url: None,
                    error: Some(err.to_string()),
                    priority: LinkPriority::Error,
                }
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for LinksStage {
    fn name(&self) -> &str {
        StageKind::Links.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let repository = ctx.storage()?;
        let pages = crawled_pages(repository, unit.audit_id).await?;
        let check_external = unit
            .args
            .get("checkExternal")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        // host -> [(url, source, external)], each url once
        let mut by_host: BTreeMap<String, Vec<(Url, String, bool)>> = BTreeMap::new();
        let mut seen = HashSet::new();
        for page in &pages {
            for link in &page.page_data.links {
                if link.external && !check_external {
                    continue;
                }
                let Ok(url) = Url::parse(&link.url) else {
                    continue;
                };
                if !seen.insert(url.to_string()) {
                    continue;
                }
                let host = url.host_str().unwrap_or_default().to_string();
                by_host
                    .entry(host)
                    .or_default()
                    .push((url, page.url.clone(), link.external));
            }
        }

        let hosts = by_host.len();
        let limit = self.per_host_concurrency;
        let checks = join_all(by_host.into_iter().map(|(host, links)| async move {
            debug!(host = %host, links = links.len(), "Checking links");
            stream::iter(links)
                .map(|(url, source, external)| self.check(url, source, external))
                .buffer_unordered(limit)
                .collect::<Vec<_>>()
                .await
        }))
        .await;

        if ctx.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        let mut link_checker: Vec<LinkCheck> = checks.into_iter().flatten().collect();
        link_checker.sort_by(|a, b| a.url.cmp(&b.url));

        let mut stats = LinkStats {
            total: link_checker.len(),
            hosts,
            ..Default::default()
        };
        for check in &link_checker {
            match check.priority {
                LinkPriority::Ok => stats.ok += 1,
                LinkPriority::Warning => stats.redirect += 1,
                LinkPriority::Error => stats.broken += 1,
            }
            if check.external {
                stats.external += 1;
            } else {
                stats.internal += 1;
            }
        }
        stats.link_checker = link_checker;

        Ok(StageOutput::complete(encode("link stats", &stats)?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{LinkRecord, PageData};
    use crate::stages::fixtures;
    use crate::testing::MockFetcher;

    fn link(url: &str, external: bool) -> LinkRecord {
        LinkRecord {
            url: url.to_string(),
            text: String::new(),
            external,
        }
    }

    #[tokio::test]
    async fn test_classifies_links() {
        let (repository, audit) = fixtures::audit_with_pages(vec![
            (
                "https://example.com/",
                PageData {
                    links: vec![
                        link("https://example.com/a", false),
                        link("https://example.com/old", false),
                        link("https://example.com/gone", false),
                        link("https://other.org/", true),
                    ],
                    ..Default::default()
                },
            ),
            (
                "https://example.com/a",
                PageData {
                    links: vec![link("https://example.com/a", false)],
                    ..Default::default()
                },
            ),
        ])
        .await;

        let fetcher = Arc::new(
            MockFetcher::new()
                .with_page("https://example.com/a", "<title>A</title>")
                .with_redirect("https://example.com/old", "https://example.com/a")
                .with_status("https://example.com/gone", 404),
        );
        let ctx = fixtures::scoped(&repository).await;
        let unit = WorkUnit::new("links", audit.id, json!({}));

        let output = LinksStage::new(fetcher.clone()).run(&unit, &ctx).await.unwrap();
        let stats = &output.value;
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["ok"], 1);
        assert_eq!(stats["redirect"], 1);
        assert_eq!(stats["broken"], 1);
        // External links are skipped by default, duplicates probed once
        assert!(!fetcher.probe_calls().contains(&"https://other.org/".to_string()));
        assert_eq!(fetcher.probe_calls().len(), 3);

        let gone = stats["linkChecker"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["url"] == "https://example.com/gone")
            .unwrap();
        assert_eq!(gone["priority"], "error");
        assert_eq!(gone["status_code"], 404);
    }

    #[tokio::test]
    async fn test_unreachable_link_recorded_not_fatal() {
        let (repository, audit) = fixtures::audit_with_pages(vec![(
            "https://example.com/",
            PageData {
                links: vec![link("https://other.org/", true)],
                ..Default::default()
            },
        )])
        .await;

        let fetcher = Arc::new(MockFetcher::new().with_failures("https://other.org/", 1));
        let ctx = fixtures::scoped(&repository).await;
        let unit = WorkUnit::new("links", audit.id, json!({"checkExternal": true}));

        let output = LinksStage::new(fetcher).run(&unit, &ctx).await.unwrap();
        assert_eq!(output.value["broken"], 1);
        assert_eq!(output.value["external"], 1);
        assert!(output.value["linkChecker"][0]["error"].is_string());
    }

    #[tokio::test]
    async fn test_requires_crawl() {
        let repository = crate::storage::AuditRepository::new(Arc::new(
            crate::storage::MemoryAuditStore::new(),
        ));
        let audit = repository
            .create_audit("https://example.com/", "owner-1")
            .await
            .unwrap();
        let ctx = fixtures::scoped(&repository).await;
        let unit = WorkUnit::new("links", audit.id, json!({}));

        let err = LinksStage::new(Arc::new(MockFetcher::new()))
            .run(&unit, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
    }
}
