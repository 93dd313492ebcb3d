//! Audit persistence.
//!
//! [`AuditStore`] is the backend seam: load, locked read-modify-write, and
//! page storage. [`AuditRepository`] builds the audit operations on top of it.
//! Every mutation of an audit goes through [`AuditStore::update_audit`], which
//! serializes writers per audit, so concurrent stages never lose each other's
//! merges.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult, TaskExecutionError};
use crate::lifecycle::{self, AuditEvent};
use crate::models::{Audit, AuditId, AuditPage, AuditStatus, StageKind, StageOutput};

mod memory;
pub use memory::MemoryAuditStore;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAuditStore;

/// Mutation applied to an audit under its lock. Returning an error aborts the
/// update and leaves the stored audit untouched.
pub type AuditMutation<'a> = &'a (dyn Fn(&mut Audit) -> AuditResult<()> + Send + Sync);

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn create_audit(&self, audit: &Audit) -> AuditResult<()>;

    async fn load_audit(&self, id: AuditId) -> AuditResult<Audit>;

    /// Read-modify-write under the audit's lock. Returns the stored result.
    async fn update_audit(&self, id: AuditId, mutate: AuditMutation<'_>) -> AuditResult<Audit>;

    /// Delete an audit together with its pages.
    async fn delete_audit(&self, id: AuditId) -> AuditResult<()>;

    async fn insert_pages(&self, pages: &[AuditPage]) -> AuditResult<()>;

    /// Store pages under an unpublished set that readers do not see.
    async fn stage_pages(
        &self,
        audit_id: AuditId,
        generation: Uuid,
        pages: &[AuditPage],
    ) -> AuditResult<()>;

    /// Atomically replace the published pages with the staged set.
    async fn publish_pages(&self, audit_id: AuditId, generation: Uuid) -> AuditResult<usize>;

    async fn discard_staged_pages(&self, audit_id: AuditId) -> AuditResult<usize>;

    /// Published pages in crawl order.
    async fn list_pages(&self, audit_id: AuditId) -> AuditResult<Vec<AuditPage>>;
}

/// Audit operations used by the pipeline and by callers.
#[derive(Clone)]
pub struct AuditRepository {
    store: Arc<dyn AuditStore>,
}

impl AuditRepository {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Accept an audit request for `url`. Only absolute http(s) URLs are valid.
    pub async fn create_audit(&self, url: &str, owner: &str) -> AuditResult<Audit> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| AuditError::Validation(format!("invalid url {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(AuditError::Validation(format!(
                "audit target must be an http(s) url: {}",
                url
            )));
        }
        if owner.trim().is_empty() {
            return Err(AuditError::Validation("owner is required".to_string()));
        }

        let audit = Audit::builder()
            .url(parsed.to_string())
            .owner(owner.to_string())
            .build();
        self.store.create_audit(&audit).await?;
        info!(audit_id = %audit.id, url = %audit.url, "Audit created");
        Ok(audit)
    }

    pub async fn load_audit(&self, id: AuditId) -> AuditResult<Audit> {
        self.store.load_audit(id).await
    }

    /// Write `value` under `stage_key` in `audit_data`.
    ///
    /// With `expected_status`, the write only happens if the audit is still in
    /// that status (compare-and-set). Writing the same value twice is a no-op.
    pub async fn merge_audit_data(
        &self,
        id: AuditId,
        stage_key: &str,
        value: Value,
        expected_status: Option<AuditStatus>,
    ) -> AuditResult<AuditStatus> {
        let audit = self
            .store
            .update_audit(id, &|audit: &mut Audit| {
                if let Some(expected) = expected_status {
                    if audit.status != expected {
                        return Err(AuditError::StatusConflict {
                            expected,
                            actual: audit.status,
                        });
                    }
                }
                if audit.audit_data.get(stage_key) != Some(&value) {
                    audit.audit_data.insert(stage_key.to_string(), value.clone());
                    audit.updated_at = Utc::now();
                }
                Ok(())
            })
            .await?;
        debug!(audit_id = %id, key = %stage_key, "Audit data merged");
        Ok(audit.status)
    }

    pub async fn set_status(&self, id: AuditId, status: AuditStatus) -> AuditResult<()> {
        self.store
            .update_audit(id, &|audit: &mut Audit| {
                audit.status = status;
                audit.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn begin_stage(
        &self,
        id: AuditId,
        stage: StageKind,
        operation_id: Uuid,
    ) -> AuditResult<AuditStatus> {
        self.apply(id, AuditEvent::StageStarted {
            stage,
            operation_id,
        })
        .await
    }

    /// Merge a stage result and close the stage in one locked update. A run
    /// that is no longer the stage's recorded operation changes nothing.
    pub async fn complete_stage(
        &self,
        id: AuditId,
        stage: StageKind,
        operation_id: Uuid,
        output: StageOutput,
    ) -> AuditResult<AuditStatus> {
        self.apply(id, AuditEvent::StageSucceeded {
            stage,
            operation_id,
            value: output.value,
            complete: output.complete,
        })
        .await
    }

    pub async fn fail_stage(
        &self,
        id: AuditId,
        stage: StageKind,
        operation_id: Uuid,
        error: TaskExecutionError,
    ) -> AuditResult<AuditStatus> {
        self.apply(id, AuditEvent::StageFailed {
            stage,
            operation_id,
            error,
        })
        .await
    }

    async fn apply(&self, id: AuditId, event: AuditEvent) -> AuditResult<AuditStatus> {
        let audit = self
            .store
            .update_audit(id, &|audit: &mut Audit| {
                lifecycle::apply(audit, event.clone(), Utc::now());
                Ok(())
            })
            .await?;
        Ok(audit.status)
    }

    pub async fn save_pages(&self, pages: &[AuditPage]) -> AuditResult<()> {
        if pages.is_empty() {
            return Ok(());
        }
        self.store.insert_pages(pages).await
    }

    /// Add pages to the unpublished set `generation`. Readers keep seeing the
    /// current pages until [`publish_pages`](Self::publish_pages).
    pub async fn stage_pages(
        &self,
        audit_id: AuditId,
        generation: Uuid,
        pages: &[AuditPage],
    ) -> AuditResult<()> {
        if pages.is_empty() {
            return Ok(());
        }
        self.store.stage_pages(audit_id, generation, pages).await
    }

    /// Replace the audit's pages with the staged set `generation` in one step.
    /// Returns the number of pages now stored.
    pub async fn publish_pages(&self, audit_id: AuditId, generation: Uuid) -> AuditResult<usize> {
        let published = self.store.publish_pages(audit_id, generation).await?;
        debug!(audit_id = %audit_id, generation = %generation, published, "Pages published");
        Ok(published)
    }

    /// Drop every unpublished page set of the audit.
    pub async fn discard_staged_pages(&self, audit_id: AuditId) -> AuditResult<usize> {
        self.store.discard_staged_pages(audit_id).await
    }

    pub async fn list_pages(&self, audit_id: AuditId) -> AuditResult<Vec<AuditPage>> {
        self.store.list_pages(audit_id).await
    }

    pub async fn delete_audit(&self, id: AuditId) -> AuditResult<()> {
        self.store.delete_audit(id).await?;
        info!(audit_id = %id, "Audit deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn repository() -> AuditRepository {
        AuditRepository::new(Arc::new(MemoryAuditStore::new()))
    }

    #[tokio::test]
    async fn test_create_rejects_non_http_urls() {
        let repo = repository();
        assert!(matches!(
            repo.create_audit("ftp://example.com", "o").await,
            Err(AuditError::Validation(_))
        ));
        assert!(matches!(
            repo.create_audit("not a url", "o").await,
            Err(AuditError::Validation(_))
        ));
        let audit = repo.create_audit("https://example.com", "o").await.unwrap();
        assert_eq!(audit.status, AuditStatus::Pending);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let repo = repository();
        let audit = repo.create_audit("https://example.com", "o").await.unwrap();

        repo.merge_audit_data(audit.id, "linkStats", json!({"broken": 2}), None)
            .await
            .unwrap();
        let first = repo.load_audit(audit.id).await.unwrap();

        repo.merge_audit_data(audit.id, "linkStats", json!({"broken": 2}), None)
            .await
            .unwrap();
        let second = repo.load_audit(audit.id).await.unwrap();

        assert_eq!(first.audit_data, second.audit_data);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_merge_compare_and_set() {
        let repo = repository();
        let audit = repo.create_audit("https://example.com", "o").await.unwrap();

        let result = repo
            .merge_audit_data(audit.id, "metaAnalysis", json!({}), Some(AuditStatus::Done))
            .await;
        assert!(matches!(result, Err(AuditError::StatusConflict { .. })));
        assert!(repo.load_audit(audit.id).await.unwrap().audit_data.is_empty());
    }

    #[tokio::test]
    async fn test_missing_audit_is_not_found() {
        let repo = repository();
        let result = repo.load_audit(AuditId::new()).await;
        assert!(matches!(result, Err(AuditError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_stage_merges_are_not_lost() {
        let repo = repository();
        let audit = repo.create_audit("https://example.com", "o").await.unwrap();
        let stages = [StageKind::Links, StageKind::Images, StageKind::Headings, StageKind::Meta];

        let mut runs = Vec::new();
        for stage in stages {
            let operation_id = Uuid::now_v7();
            repo.begin_stage(audit.id, stage, operation_id).await.unwrap();
            runs.push((stage, operation_id));
        }

        let audit_id = audit.id;
        let mut handles = Vec::new();
        for (stage, operation_id) in runs {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let output = StageOutput::complete(json!({"stage": stage.name()}));
                repo.complete_stage(audit_id, stage, operation_id, output).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let audit = repo.load_audit(audit.id).await.unwrap();
        assert_eq!(audit.audit_data.len(), 4);
        assert_eq!(audit.status, AuditStatus::Done);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_pages() {
        let repo = repository();
        let audit = repo.create_audit("https://example.com", "o").await.unwrap();
        let page = AuditPage::builder()
            .audit_id(audit.id)
            .url("https://example.com/")
            .status_code(200u16)
            .build();
        repo.save_pages(&[page]).await.unwrap();
        assert_eq!(repo.list_pages(audit.id).await.unwrap().len(), 1);

        repo.delete_audit(audit.id).await.unwrap();
        assert!(repo.list_pages(audit.id).await.unwrap().is_empty());
        assert!(repo.load_audit(audit.id).await.is_err());
    }

    fn page(audit_id: AuditId, url: &str) -> AuditPage {
        AuditPage::builder()
            .audit_id(audit_id)
            .url(url)
            .status_code(200u16)
            .build()
    }

    #[tokio::test]
    async fn test_staged_pages_replace_published_ones_on_publish() {
        let repo = repository();
        let audit = repo.create_audit("https://example.com", "o").await.unwrap();
        repo.save_pages(&[page(audit.id, "https://example.com/old")])
            .await
            .unwrap();

        let generation = Uuid::now_v7();
        repo.stage_pages(
            audit.id,
            generation,
            &[
                page(audit.id, "https://example.com/"),
                page(audit.id, "https://example.com/a"),
            ],
        )
        .await
        .unwrap();

        // Unpublished pages stay invisible
        let pages = repo.list_pages(audit.id).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].url, "https://example.com/old");

        assert_eq!(repo.publish_pages(audit.id, generation).await.unwrap(), 2);
        let urls: Vec<_> = repo
            .list_pages(audit.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.url)
            .collect();
        assert_eq!(urls, vec!["https://example.com/", "https://example.com/a"]);
    }

    #[tokio::test]
    async fn test_discarded_pages_never_show_up() {
        let repo = repository();
        let audit = repo.create_audit("https://example.com", "o").await.unwrap();
        repo.save_pages(&[page(audit.id, "https://example.com/")])
            .await
            .unwrap();

        let generation = Uuid::now_v7();
        repo.stage_pages(audit.id, generation, &[page(audit.id, "https://example.com/b")])
            .await
            .unwrap();
        assert_eq!(repo.discard_staged_pages(audit.id).await.unwrap(), 1);

        let pages = repo.list_pages(audit.id).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].url, "https://example.com/");
    }
}
