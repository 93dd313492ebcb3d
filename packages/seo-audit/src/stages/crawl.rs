use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use task_guard::ChunkedProcessor;
use tracing::{info, warn};
use uuid::Uuid;

use super::encode;
use crate::crawler::{CrawlConfig, CrawlMode, Crawler};
use crate::error::{AuditError, AuditResult};
use crate::models::{AuditId, AuditPage, StageKind, StageOutput};
use crate::storage::AuditRepository;
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

/// Crawls the audit's target and replaces its stored pages.
///
/// Pages are staged in chunks while the crawl runs, so memory stays bounded
/// by the chunk size. The staged set replaces the stored pages only once the
/// crawl succeeds; a failed or cancelled crawl leaves the previous pages in
/// place. A crawl that stops at `maxPages` with URLs still queued is reported
/// as partial.
///
/// Arguments (all optional): `maxPages`, `depthLimit`, `includeExternal`,
/// `mode` (`"http"` or `"browser"`).
pub struct CrawlStage {
    crawler: Arc<Crawler>,
    chunks: ChunkedProcessor,
    defaults: CrawlConfig,
}

impl CrawlStage {
    pub fn new(crawler: Arc<Crawler>, chunks: ChunkedProcessor, defaults: CrawlConfig) -> Self {
        Self {
            crawler,
            chunks,
            defaults,
        }
    }

    fn config_for(&self, args: &Value) -> AuditResult<CrawlConfig> {
        let mut config = self.defaults.clone();
        if let Some(max_pages) = args.get("maxPages").and_then(Value::as_u64) {
            if max_pages == 0 {
                return Err(AuditError::Validation("maxPages must be at least 1".into()));
            }
            config.max_pages = max_pages as usize;
        }
        if let Some(depth) = args.get("depthLimit").and_then(Value::as_u64) {
            config.depth_limit = depth as usize;
        }
        if let Some(external) = args.get("includeExternal").and_then(Value::as_bool) {
            config.include_external = external;
        }
        if let Some(mode) = args.get("mode") {
            config.mode = serde_json::from_value::<CrawlMode>(mode.clone())
                .map_err(|e| AuditError::Validation(format!("invalid crawl mode: {}", e)))?;
        }
        Ok(config)
    }
}

#[async_trait]
impl UnitOfWork for CrawlStage {
    fn name(&self) -> &str {
        StageKind::Crawl.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let repository = ctx.storage()?;
        let audit = repository.load_audit(unit.audit_id).await?;
        let config = self.config_for(&unit.args)?;
        let mut session = self.crawler.session(&audit.url, config.clone())?;

        let audit_id = audit.id;
        // Sets left behind by an interrupted crawl are never published
        let stale = repository.discard_staged_pages(audit_id).await?;
        let generation = Uuid::now_v7();
        info!(
            audit_id = %audit_id,
            url = %audit.url,
            max_pages = config.max_pages,
            depth_limit = config.depth_limit,
            generation = %generation,
            stale,
            "Crawl started"
        );

        let pages = session.pages().take_until(ctx.cancel.cancelled());
        let drained = self
            .chunks
            .drain_stream(pages, |chunk| async move {
                let pages = chunk
                    .into_iter()
                    .map(|page| page.map(|p| p.into_audit_page(audit_id)))
                    .collect::<Result<Vec<AuditPage>, _>>()?;
                repository.stage_pages(audit_id, generation, &pages).await
            })
            .await;

        if let Err(err) = drained {
            discard(repository, audit_id).await;
            return Err(err);
        }
        if ctx.is_cancelled() {
            discard(repository, audit_id).await;
            return Err(AuditError::Cancelled);
        }

        let published = repository.publish_pages(audit_id, generation).await?;
        let summary = session.summary();
        info!(
            audit_id = %audit_id,
            published,
            pages_crawled = summary.pages_crawled,
            failed_pages = summary.failed_pages,
            truncated = summary.truncated,
            "Crawl finished"
        );

        let mut stats = encode("crawl summary", &summary)?;
        if let Value::Object(map) = &mut stats {
            map.insert("rootUrl".into(), json!(session.root().as_str()));
            map.insert("maxPages".into(), json!(config.max_pages));
            map.insert("depthLimit".into(), json!(config.depth_limit));
        }

        Ok(if summary.truncated {
            StageOutput::partial(stats)
        } else {
            StageOutput::complete(stats)
        })
    }
}

async fn discard(repository: &AuditRepository, audit_id: AuditId) {
    if let Err(e) = repository.discard_staged_pages(audit_id).await {
        warn!(audit_id = %audit_id, error = %e, "Failed to discard staged pages");
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::storage::MemoryAuditStore;
    use crate::task::StoragePool;
    use crate::testing::MockFetcher;

    fn stage(fetcher: MockFetcher) -> CrawlStage {
        let crawler = Crawler::new(Arc::new(fetcher), NonZeroU32::new(1000).unwrap());
        CrawlStage::new(
            Arc::new(crawler),
            ChunkedProcessor::new(1).unwrap(),
            CrawlConfig::default(),
        )
    }

    fn three_pages() -> MockFetcher {
        MockFetcher::new()
            .with_page(
                "https://example.com/",
                r#"<title>Home</title><a href="/a">A</a><a href="/b">B</a>"#,
            )
            .with_page("https://example.com/a", "<title>A</title>")
            .with_page("https://example.com/b", "<title>B</title>")
    }

    async fn context(repository: &AuditRepository, cancel: CancellationToken) -> WorkContext {
        let pool = StoragePool::new(repository.clone(), 1);
        let handle = pool.acquire(&cancel).await.unwrap();
        WorkContext::new(cancel).with_storage(handle)
    }

    async fn setup() -> (AuditRepository, AuditId, WorkContext) {
        let repository = AuditRepository::new(Arc::new(MemoryAuditStore::new()));
        let audit = repository
            .create_audit("https://example.com/", "owner-1")
            .await
            .unwrap();
        let ctx = context(&repository, CancellationToken::new()).await;
        (repository, audit.id, ctx)
    }

    fn urls(pages: Vec<AuditPage>) -> Vec<String> {
        pages.into_iter().map(|p| p.url).collect()
    }

    #[tokio::test]
    async fn test_truncated_crawl_is_partial() {
        let (repository, audit_id, ctx) = setup().await;
        let unit = WorkUnit::new("crawl", audit_id, json!({"maxPages": 2}));

        let output = stage(three_pages()).run(&unit, &ctx).await.unwrap();
        assert!(!output.complete);
        assert_eq!(output.value["pagesCrawled"], 2);
        assert_eq!(output.value["truncated"], true);
        assert_eq!(repository.list_pages(audit_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recrawl_replaces_pages() {
        let (repository, audit_id, ctx) = setup().await;
        let unit = WorkUnit::new("crawl", audit_id, json!({}));
        let stage = stage(three_pages());

        let output = stage.run(&unit, &ctx).await.unwrap();
        assert!(output.complete);
        stage.run(&unit, &ctx).await.unwrap();
        assert_eq!(repository.list_pages(audit_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_root_fails() {
        let (_repository, audit_id, ctx) = setup().await;
        let unit = WorkUnit::new("crawl", audit_id, json!({}));

        let fetcher = MockFetcher::new().with_status("https://example.com/", 404);
        let err = stage(fetcher).run(&unit, &ctx).await.unwrap_err();
        assert!(matches!(err, AuditError::Dependency { .. }));
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let (_repository, audit_id, ctx) = setup().await;
        let unit = WorkUnit::new("crawl", audit_id, json!({"mode": "teleport"}));

        let err = stage(three_pages()).run(&unit, &ctx).await.unwrap_err();
        assert!(matches!(err, AuditError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failed_recrawl_keeps_previous_pages() {
        let (repository, audit_id, ctx) = setup().await;
        let unit = WorkUnit::new("crawl", audit_id, json!({}));
        stage(three_pages()).run(&unit, &ctx).await.unwrap();
        let before = urls(repository.list_pages(audit_id).await.unwrap());

        let down = MockFetcher::new().with_status("https://example.com/", 404);
        assert!(stage(down).run(&unit, &ctx).await.is_err());

        assert_eq!(urls(repository.list_pages(audit_id).await.unwrap()), before);
        assert_eq!(before.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_recrawl_keeps_previous_pages() {
        let (repository, audit_id, ctx) = setup().await;
        let unit = WorkUnit::new("crawl", audit_id, json!({}));
        let stage = stage(three_pages());
        stage.run(&unit, &ctx).await.unwrap();

        let cancel = CancellationToken::new();
        let cancelled = context(&repository, cancel.clone()).await;
        cancel.cancel();
        let err = stage.run(&unit, &cancelled).await.unwrap_err();
        assert!(matches!(err, AuditError::Cancelled));

        assert_eq!(repository.list_pages(audit_id).await.unwrap().len(), 3);
        assert_eq!(repository.discard_staged_pages(audit_id).await.unwrap(), 0);
    }
}
