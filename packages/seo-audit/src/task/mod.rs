//! Units of work and the reliability chain around them.
//!
//! A stage implements [`UnitOfWork`] once. [`TaskWrapper`] then wraps it in
//! decorators, outermost first:
//!
//! ```text
//! Guarded → Retrying → Cached → RateLimited → Scoped → stage
//! ```
//!
//! - `Guarded` classifies and logs any failure and returns a uniform
//!   [`TaskExecutionError`](crate::error::TaskExecutionError).
//! - `Retrying` re-runs the chain below on transient errors.
//! - `Cached` returns a stored result or single-flights the computation.
//! - `RateLimited` waits (bounded, cancellable) for a slot per task name and
//!   gives the slot back if the work is cancelled.
//! - `Scoped` lends the stage a storage handle that is returned on every exit
//!   path.

use async_trait::async_trait;
use serde_json::Value;
use task_guard::CacheKey;
use tokio_util::sync::CancellationToken;

use crate::error::{AuditError, AuditResult};
use crate::models::{AuditId, StageOutput};
use crate::storage::AuditRepository;

mod decorators;
mod scope;
mod wrapper;

pub use decorators::{Cached, Guarded, RateLimited, Retrying};
pub use scope::{Scoped, StorageHandle, StoragePool};
pub use wrapper::{RateLimit, TaskWrapper};

/// Identity of one logical operation: task name plus arguments. Two units
/// with equal fields are the same operation for caching and rate limiting.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub task_name: String,
    pub audit_id: AuditId,
    pub args: Value,
}

impl WorkUnit {
    pub fn new(task_name: impl Into<String>, audit_id: AuditId, args: Value) -> Self {
        Self {
            task_name: task_name.into(),
            audit_id,
            args,
        }
    }

    /// Cache key scoped to the audit, so an audit's entries can be dropped
    /// together.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.task_name, self.audit_id, &self.args)
    }

    /// String argument, if present.
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }
}

/// What a running unit can reach besides its arguments.
pub struct WorkContext {
    pub cancel: CancellationToken,
    storage: Option<StorageHandle>,
}

impl WorkContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            storage: None,
        }
    }

    pub(crate) fn with_storage(&self, handle: StorageHandle) -> Self {
        Self {
            cancel: self.cancel.clone(),
            storage: Some(handle),
        }
    }

    /// The storage handle lent by [`Scoped`].
    pub fn storage(&self) -> AuditResult<&AuditRepository> {
        self.storage
            .as_ref()
            .map(StorageHandle::repository)
            .ok_or_else(|| AuditError::Storage("no storage handle in scope".to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, unit: &WorkUnit, ctx: &WorkContext) -> AuditResult<StageOutput>;
}
