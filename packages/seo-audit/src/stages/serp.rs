use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use url::Url;

use super::{encode, root_page};
use crate::dependencies::{GuardedDependency, SerpProvider, SerpResult};
use crate::error::{AuditError, AuditResult};
use crate::models::{StageKind, StageOutput};
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

const RESULTS_LIMIT: usize = 10;
const COMPETITORS_LIMIT: usize = 5;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SerpAnalysis {
    keyword: String,
    domain: String,
    /// Position of the audited domain, if it ranks in the fetched results
    position: Option<u32>,
    total_results: usize,
    competitors: Vec<SerpResult>,
}

/// Where the audited site ranks for a keyword.
///
/// The keyword comes from the `keyword` argument, or falls back to the root
/// page title when the site has been crawled.
pub struct SerpStage {
    provider: Arc<dyn SerpProvider>,
    guard: GuardedDependency,
}

impl SerpStage {
    pub fn new(provider: Arc<dyn SerpProvider>, guard: GuardedDependency) -> Self {
        Self { provider, guard }
    }
}

/// Host without a leading `www.`, so `www.example.com` ranks as `example.com`.
fn domain_of(url: &str) -> Option<String> {
    let host = Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

#[async_trait]
impl UnitOfWork for SerpStage {
    fn name(&self) -> &str {
        StageKind::Serp.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let repository = ctx.storage()?;
        let audit = repository.load_audit(unit.audit_id).await?;
        let domain = domain_of(&audit.url)
            .ok_or_else(|| AuditError::Validation(format!("audit url has no host: {}", audit.url)))?;

        let keyword = match unit.arg_str("keyword").map(str::trim) {
            Some(keyword) if !keyword.is_empty() => keyword.to_string(),
            _ => {
                let pages = repository.list_pages(audit.id).await?;
                root_page(&pages)
                    .and_then(|p| p.page_data.title.as_deref())
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        AuditError::Validation(
                            "no keyword given and no crawled page title to fall back on".into(),
                        )
                    })?
            }
        };

        let provider = self.provider.as_ref();
        let query = keyword.as_str();
        let results = self
            .guard
            .call(provider.name(), move || provider.search(query, RESULTS_LIMIT))
            .await?;

        let position = results
            .iter()
            .find(|r| domain_of(&r.url).as_deref() == Some(domain.as_str()))
            .map(|r| r.position);
        let competitors: Vec<SerpResult> = results
            .iter()
            .filter(|r| domain_of(&r.url).as_deref() != Some(domain.as_str()))
            .take(COMPETITORS_LIMIT)
            .cloned()
            .collect();
        info!(audit_id = %audit.id, keyword = %keyword, position = ?position, "SERP position checked");

        let analysis = SerpAnalysis {
            keyword,
            domain,
            position,
            total_results: results.len(),
            competitors,
        };
        Ok(StageOutput::complete(encode("serp analysis", &analysis)?))
    }
}
