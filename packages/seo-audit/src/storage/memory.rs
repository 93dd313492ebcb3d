//! In-memory audit store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AuditMutation, AuditStore};
use crate::error::{AuditError, AuditResult};
use crate::models::{Audit, AuditId, AuditPage};

/// Audit store kept in process memory.
///
/// Each audit sits behind its own async mutex, which plays the role of a row
/// lock. Updates run against a copy and are only written back on success.
/// Staged page sets live apart from the published ones until swapped in.
#[derive(Default)]
pub struct MemoryAuditStore {
    audits: DashMap<AuditId, Arc<Mutex<Audit>>>,
    pages: DashMap<AuditId, Vec<AuditPage>>,
    staged: DashMap<(AuditId, Uuid), Vec<AuditPage>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, id: AuditId) -> AuditResult<Arc<Mutex<Audit>>> {
        self.audits
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AuditError::not_found("audit", id))
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn create_audit(&self, audit: &Audit) -> AuditResult<()> {
        if self.audits.contains_key(&audit.id) {
            return Err(AuditError::Validation(format!(
                "audit {} already exists",
                audit.id
            )));
        }
        self.audits
            .insert(audit.id, Arc::new(Mutex::new(audit.clone())));
        Ok(())
    }

    async fn load_audit(&self, id: AuditId) -> AuditResult<Audit> {
        let cell = self.cell(id)?;
        let audit = cell.lock().await;
        Ok(audit.clone())
    }

    async fn update_audit(&self, id: AuditId, mutate: AuditMutation<'_>) -> AuditResult<Audit> {
        let cell = self.cell(id)?;
        let mut stored = cell.lock().await;
        let mut draft = stored.clone();
        mutate(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    async fn delete_audit(&self, id: AuditId) -> AuditResult<()> {
        self.audits
            .remove(&id)
            .ok_or_else(|| AuditError::not_found("audit", id))?;
        self.pages.remove(&id);
        self.staged.retain(|(audit_id, _), _| *audit_id != id);
        Ok(())
    }

    async fn insert_pages(&self, pages: &[AuditPage]) -> AuditResult<()> {
        for page in pages {
            if !self.audits.contains_key(&page.audit_id) {
                return Err(AuditError::not_found("audit", page.audit_id));
            }
        }
        for page in pages {
            self.pages
                .entry(page.audit_id)
                .or_default()
                .push(page.clone());
        }
        Ok(())
    }

    async fn stage_pages(
        &self,
        audit_id: AuditId,
        generation: Uuid,
        pages: &[AuditPage],
    ) -> AuditResult<()> {
        if !self.audits.contains_key(&audit_id) {
            return Err(AuditError::not_found("audit", audit_id));
        }
        self.staged
            .entry((audit_id, generation))
            .or_default()
            .extend(pages.iter().cloned());
        Ok(())
    }

    async fn publish_pages(&self, audit_id: AuditId, generation: Uuid) -> AuditResult<usize> {
        if !self.audits.contains_key(&audit_id) {
            return Err(AuditError::not_found("audit", audit_id));
        }
        let pages = self
            .staged
            .remove(&(audit_id, generation))
            .map(|(_, pages)| pages)
            .unwrap_or_default();
        let published = pages.len();
        self.pages.insert(audit_id, pages);
        Ok(published)
    }

    async fn discard_staged_pages(&self, audit_id: AuditId) -> AuditResult<usize> {
        let mut discarded = 0;
        self.staged.retain(|(id, _), pages| {
            if *id == audit_id {
                discarded += pages.len();
                false
            } else {
                true
            }
        });
        Ok(discarded)
    }

    async fn list_pages(&self, audit_id: AuditId) -> AuditResult<Vec<AuditPage>> {
        Ok(self
            .pages
            .get(&audit_id)
            .map(|pages| pages.value().clone())
            .unwrap_or_default())
    }
}
