//! SEO audit pipeline.
//!
//! Runs independent, slow and unreliable analysis stages (crawl, link check,
//! image check, headings, meta, SERP, AI suggestions, performance, score)
//! against one shared audit document. Every stage is a unit of work wrapped in
//! the same reliability chain: cache, rate limit, scoped storage, retry, and
//! uniform error classification. Stage results are merged into the audit under
//! a per-audit lock and drive the audit's lifecycle status.
//!
//! # Usage
//!
//! ```rust,ignore
//! use seo_audit::{AuditKernel, Config, StageKind};
//!
//! let kernel = AuditKernel::from_config(Config::from_env()?).await?;
//! let audit = kernel.repository.create_audit("https://example.com", "owner-1").await?;
//!
//! let handle = kernel
//!     .dispatcher
//!     .submit_analysis("owner-1", audit.id, StageKind::Crawl)
//!     .await?;
//! handle.wait().await;
//!
//! let snapshot = kernel.dispatcher.get_audit_snapshot(audit.id).await?;
//! ```

pub mod config;
pub mod crawler;
pub mod dependencies;
pub mod error;
pub mod fetch;
pub mod kernel;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod stages;
pub mod storage;
pub mod task;
pub mod testing;

pub use config::Config;
pub use crawler::{CrawlConfig, CrawlMode, CrawlSession, CrawlSummary, Crawler};
pub use error::{AuditError, AuditResult, ErrorKind, TaskExecutionError};
pub use kernel::{AuditKernel, KernelComponents};
pub use models::{
    Audit, AuditId, AuditPage, AuditSnapshot, AuditStatus, PageData, StageKind, StageRecord,
    StageStatus,
};
pub use pipeline::{OperationHandle, OperationStatus, TaskDispatcher};
pub use storage::{AuditRepository, AuditStore, MemoryAuditStore};
