use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{UnitOfWork, WorkContext, WorkUnit};
use crate::error::{AuditError, AuditResult};
use crate::models::StageOutput;
use crate::storage::AuditRepository;

/// Bounded pool of storage handles.
pub struct StoragePool {
    repository: AuditRepository,
    permits: Arc<Semaphore>,
    size: usize,
}

impl StoragePool {
    pub fn new(repository: AuditRepository, size: usize) -> Self {
        let size = size.max(1);
        Self {
            repository,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free handle.
    pub async fn acquire(&self, cancel: &CancellationToken) -> AuditResult<StorageHandle> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(AuditError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| AuditError::Storage("storage pool closed".to_string()))?,
        };
        Ok(StorageHandle {
            repository: self.repository.clone(),
            _permit: permit,
        })
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

/// A borrowed storage handle. Dropping it returns it to the pool.
pub struct StorageHandle {
    repository: AuditRepository,
    _permit: OwnedSemaphorePermit,
}

impl StorageHandle {
    pub fn repository(&self) -> &AuditRepository {
        &self.repository
    }
}

/// Lends the inner unit a storage handle for the duration of one run.
pub struct Scoped {
    inner: Arc<dyn UnitOfWork>,
    pool: Arc<StoragePool>,
}

impl Scoped {
    pub fn new(inner: Arc<dyn UnitOfWork>, pool: Arc<StoragePool>) -> Self {
        Self { inner, pool }
    }
}

#[async_trait]
impl UnitOfWork for Scoped {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
        let handle = self.pool.acquire(&ctx.cancel).await?;
        debug!(task_name = %unit.task_name, available = self.pool.available(), "Storage handle acquired");
        let scoped = ctx.with_storage(handle);
        self.inner.run(unit, &scoped).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::AuditId;
    use crate::storage::MemoryAuditStore;

    struct Probe;

    #[async_trait]
    impl UnitOfWork for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn run(&self, _unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput> {
            ctx.storage()?;
            Err(AuditError::Validation("boom".into()))
        }
    }

    fn pool(size: usize) -> Arc<StoragePool> {
        let repository = AuditRepository::new(Arc::new(MemoryAuditStore::new()));
        Arc::new(StoragePool::new(repository, size))
    }

    #[tokio::test]
    async fn test_handle_released_on_error() {
        let pool = pool(1);
        let scoped = Scoped::new(Arc::new(Probe), pool.clone());
        let unit = WorkUnit::new("probe", AuditId::new(), json!({}));
        let ctx = WorkContext::new(CancellationToken::new());

        let result = scoped.run(&unit, &ctx).await;
        assert!(matches!(result, Err(AuditError::Validation(_))));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_unscoped_context_has_no_storage() {
        let ctx = WorkContext::new(CancellationToken::new());
        assert!(matches!(ctx.storage(), Err(AuditError::Storage(_))));
    }

    #[tokio::test]
    async fn test_acquire_is_cancellable() {
        let pool = pool(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        cancel.cancel();
        assert!(matches!(
            pool.acquire(&cancel).await,
            Err(AuditError::Cancelled)
        ));
    }
}
