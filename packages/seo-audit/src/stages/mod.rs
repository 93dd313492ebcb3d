//! Analysis stages.
//!
//! Each stage is one [`UnitOfWork`](crate::task::UnitOfWork): it reads what it
//! needs from the audit (usually the crawled pages), computes its result and
//! returns it. Stages never write their own result; the dispatcher merges the
//! returned value under the stage's key.
//!
//! | stage         | reads                     | result key             |
//! |---------------|---------------------------|------------------------|
//! | `crawl`       | target url                | `crawlStats`           |
//! | `links`       | pages                     | `linkStats`            |
//! | `images`      | pages                     | `imageStats`           |
//! | `headings`    | pages                     | `headingsAnalysis`     |
//! | `meta`        | pages                     | `metaAnalysis`         |
//! | `serp`        | keyword or root title     | `serp_analysis`        |
//! | `ai`          | root page, other results  | `aiSuggestions`        |
//! | `performance` | target url                | `performance_analysis` |
//! | `score`       | pages, `linkStats`        | `seoScore`             |

mod ai;
mod crawl;
mod headings;
mod images;
mod links;
mod meta;
mod performance;
mod score;
mod serp;

pub use ai::AiSuggestionsStage;
pub use crawl::CrawlStage;
pub use headings::HeadingsStage;
pub use images::ImagesStage;
pub use links::LinksStage;
pub use meta::MetaStage;
pub use performance::PerformanceStage;
pub use score::ScoreStage;
pub use serp::SerpStage;

use serde::Serialize;
use serde_json::Value;

use crate::error::{AuditError, AuditResult};
use crate::models::{AuditId, AuditPage};
use crate::storage::AuditRepository;

/// Crawled pages of an audit. Page-derived stages cannot run before a crawl.
pub(crate) async fn crawled_pages(
    repository: &AuditRepository,
    audit_id: AuditId,
) -> AuditResult<Vec<AuditPage>> {
    let pages = repository.list_pages(audit_id).await?;
    if pages.is_empty() {
        return Err(AuditError::Validation(format!(
            "audit {} has no crawled pages, run the crawl first",
            audit_id
        )));
    }
    Ok(pages)
}

pub(crate) fn encode<T: Serialize>(what: &str, value: &T) -> AuditResult<Value> {
    serde_json::to_value(value).map_err(|e| AuditError::Storage(format!("{}: {}", what, e)))
}

/// The page the crawl started from.
pub(crate) fn root_page(pages: &[AuditPage]) -> Option<&AuditPage> {
    pages.iter().find(|p| p.is_root()).or_else(|| pages.first())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::models::{Audit, AuditPage, PageData};
    use crate::storage::{AuditRepository, MemoryAuditStore};
    use crate::task::{StoragePool, WorkContext};

    pub async fn audit_with_pages(pages: Vec<(&str, PageData)>) -> (AuditRepository, Audit) {
        let repository = AuditRepository::new(Arc::new(MemoryAuditStore::new()));
        let audit = repository
            .create_audit("https://example.com/", "owner-1")
            .await
            .unwrap();

        let pages: Vec<AuditPage> = pages
            .into_iter()
            .enumerate()
            .map(|(i, (url, data))| {
                AuditPage::builder()
                    .audit_id(audit.id)
                    .url(url)
                    .status_code(200u16)
                    .depth(if i == 0 { 0usize } else { 1 })
                    .page_data(data)
                    .build()
            })
            .collect();
        repository.save_pages(&pages).await.unwrap();
        (repository, audit)
    }

    pub async fn scoped(repository: &AuditRepository) -> WorkContext {
        let pool = StoragePool::new(repository.clone(), 1);
        let cancel = CancellationToken::new();
        let handle = pool.acquire(&cancel).await.unwrap();
        WorkContext::new(cancel).with_storage(handle)
    }
}
