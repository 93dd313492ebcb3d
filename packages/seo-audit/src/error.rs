//! Error taxonomy for the audit pipeline.
//!
//! Every error answers two questions: what kind it is (retry it, give up, or
//! it was cancelled) and what stable name it reports in task error details.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use task_guard::{GuardError, StoreError, Transient};
use thiserror::Error;
use uuid::Uuid;

use crate::dependencies::DependencyError;
use crate::fetch::FetchError;
use crate::models::{AuditStatus, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Operation was cancelled by the caller or timed out
    Cancelled,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

/// Uniform failure of a unit of work once its retries are spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("task {task_name} failed with {error_type}: {error_message}")]
pub struct TaskExecutionError {
    pub task_name: String,
    /// Stable name of the original error, e.g. `TransientDependencyError`
    pub error_type: String,
    pub error_message: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("{dependency} failed: {message}")]
    TransientDependency { dependency: String, message: String },

    /// A dependency answered with a permanent failure (4xx, bad payload)
    #[error("{dependency} rejected the request: {message}")]
    Dependency { dependency: String, message: String },

    #[error(transparent)]
    TaskExecution(#[from] TaskExecutionError),

    #[error("rate limit exceeded for {key}, try later")]
    RateLimitExceeded { key: String },

    #[error("audit status is {actual}, expected {expected}")]
    StatusConflict {
        expected: AuditStatus,
        actual: AuditStatus,
    },

    /// The same stage is already queued or running for this audit
    #[error("{stage} is already running for this audit (operation {operation_id})")]
    StageBusy { stage: StageKind, operation_id: Uuid },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias for audit operations
pub type AuditResult<T> = std::result::Result<T, AuditError>;

impl AuditError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AuditError::TransientDependency { .. }
            | AuditError::RateLimitExceeded { .. }
            | AuditError::Storage(_) => ErrorKind::Retryable,
            AuditError::Validation(_)
            | AuditError::NotFound { .. }
            | AuditError::Dependency { .. }
            | AuditError::StatusConflict { .. }
            | AuditError::StageBusy { .. } => ErrorKind::NonRetryable,
            AuditError::TaskExecution(e) => e.kind,
            AuditError::Cancelled | AuditError::TimedOut(_) => ErrorKind::Cancelled,
        }
    }

    /// Stable error class name reported in task error details.
    pub fn error_type(&self) -> &str {
        match self {
            AuditError::Validation(_) => "ValidationError",
            AuditError::NotFound { .. } => "ResourceNotFoundError",
            AuditError::TransientDependency { .. } => "TransientDependencyError",
            AuditError::Dependency { .. } => "DependencyError",
            AuditError::TaskExecution(e) => &e.error_type,
            AuditError::RateLimitExceeded { .. } => "RateLimitExceeded",
            AuditError::StatusConflict { .. } => "StatusConflict",
            AuditError::StageBusy { .. } => "StageBusy",
            AuditError::Cancelled => "Cancelled",
            AuditError::TimedOut(_) => "TimedOut",
            AuditError::Storage(_) => "StorageError",
        }
    }

    /// Wrap into the uniform task failure, keeping an existing wrapping as is.
    pub fn into_task_error(self, task_name: &str) -> TaskExecutionError {
        match self {
            AuditError::TaskExecution(e) => e,
            other => TaskExecutionError {
                task_name: task_name.to_string(),
                error_type: other.error_type().to_string(),
                error_message: other.to_string(),
                kind: other.kind(),
            },
        }
    }
}

/// Only dependency and storage hiccups are retried locally. Rate-limit waits
/// already took their time budget, and cancellation is final.
impl Transient for AuditError {
    fn is_transient(&self) -> bool {
        match self {
            AuditError::TransientDependency { .. } | AuditError::Storage(_) => true,
            AuditError::TaskExecution(e) => e.kind == ErrorKind::Retryable,
            _ => false,
        }
    }
}

impl From<GuardError> for AuditError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::RateLimited { key } => AuditError::RateLimitExceeded { key },
            GuardError::Cancelled => AuditError::Cancelled,
            GuardError::TimedOut(d) => AuditError::TimedOut(d),
            GuardError::InvalidArgument(msg) => AuditError::Validation(msg),
            GuardError::Store(e) => AuditError::Storage(e.to_string()),
        }
    }
}

impl From<StoreError> for AuditError {
    fn from(err: StoreError) -> Self {
        AuditError::Storage(err.to_string())
    }
}

impl From<FetchError> for AuditError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidUrl(msg) => AuditError::Validation(msg),
            e if e.is_transient() => AuditError::TransientDependency {
                dependency: "page_fetch".to_string(),
                message: e.to_string(),
            },
            e => AuditError::Dependency {
                dependency: "page_fetch".to_string(),
                message: e.to_string(),
            },
        }
    }
}

impl From<DependencyError> for AuditError {
    fn from(err: DependencyError) -> Self {
        let dependency = err.dependency().to_string();
        if err.is_transient() {
            AuditError::TransientDependency {
                dependency,
                message: err.to_string(),
            }
        } else {
            AuditError::Dependency {
                dependency,
                message: err.to_string(),
            }
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AuditError::not_found("row", "unknown"),
            other => AuditError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_keeps_original_details() {
        let err = AuditError::TransientDependency {
            dependency: "serp".into(),
            message: "503".into(),
        };
        let task = err.into_task_error("serp_analysis");
        assert_eq!(task.task_name, "serp_analysis");
        assert_eq!(task.error_type, "TransientDependencyError");
        assert_eq!(task.kind, ErrorKind::Retryable);

        // Re-wrapping does not nest
        let again = AuditError::TaskExecution(task.clone()).into_task_error("outer");
        assert_eq!(again, task);
    }

    #[test]
    fn test_validation_is_not_transient() {
        assert!(!AuditError::Validation("bad url".into()).is_transient());
        assert!(!AuditError::not_found("audit", 1).is_transient());
        assert!(AuditError::Storage("pool timeout".into()).is_transient());
        assert_eq!(AuditError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_guard_errors_map_to_taxonomy() {
        let err: AuditError = GuardError::RateLimited { key: "u1".into() }.into();
        assert_eq!(err.error_type(), "RateLimitExceeded");
        let err: AuditError = GuardError::Cancelled.into();
        assert!(matches!(err, AuditError::Cancelled));
    }
}
