use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::{AuditError, AuditResult};
use crate::fetch::PageFetcher;
use crate::models::{StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

/// Response time and payload size of the audited page, measured live.
/// Results go stale fast, so this stage is cached with a short TTL.
pub struct PerformanceStage {
    fetcher: Arc<dyn PageFetcher>,
}

impl PerformanceStage {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl UnitOfWork for PerformanceStage {
    fn name(&self) -> &str {
        StageKind::Performance.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let audit = ctx.storage()?.load_audit(unit.audit_id).await?;
        let url = Url::parse(&audit.url)
            .map_err(|e| AuditError::Validation(format!("invalid audit url: {}", e)))?;

        let page = self.fetcher.fetch(&url).await?.error_for_status()?;
        let response_time_ms = page.elapsed.as_millis() as u64;
        debug!(audit_id = %audit.id, response_time_ms, status = page.status, "Performance measured");

        Ok(StageOutput::complete(json!({
            "responseTimeMs": response_time_ms,
            "pageSizeBytes": page.body.len(),
            "statusCode": page.status,
            "finalUrl": page.final_url.as_str(),
            "redirected": page.final_url != page.url,
            "contentType": page.content_type(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::fixtures;
    use crate::testing::MockFetcher;

    #[tokio::test]
    async fn test_measures_root_page() {
        let (repository, audit) = fixtures::audit_with_pages(vec![]).await;
        let ctx = fixtures::scoped(&repository).await;
        let fetcher = Arc::new(
            MockFetcher::new().with_page("https://example.com/", "<title>Home</title>"),
        );

        let output = PerformanceStage::new(fetcher)
            .run(&WorkUnit::new("performance", audit.id, json!({})), &ctx)
            .await
            .unwrap();
        assert_eq!(output.value["statusCode"], 200);
        assert_eq!(output.value["pageSizeBytes"], 19);
        assert_eq!(output.value["responseTimeMs"], 120);
        assert_eq!(output.value["redirected"], false);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (repository, audit) = fixtures::audit_with_pages(vec![]).await;
        let ctx = fixtures::scoped(&repository).await;
        let fetcher = Arc::new(MockFetcher::new().with_status("https://example.com/", 503));

        let err = PerformanceStage::new(fetcher)
            .run(&WorkUnit::new("performance", audit.id, json!({})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::TransientDependency { .. }));
    }
}
