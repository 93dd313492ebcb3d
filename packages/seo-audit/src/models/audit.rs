//! Audit aggregate model.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{AuditError, TaskExecutionError};

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(Uuid);

impl AuditId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for AuditId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AuditId {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| AuditError::Validation(format!("invalid audit id: {}", s)))
    }
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::InProgress => "in_progress",
            AuditStatus::Done => "done",
            AuditStatus::Error => "error",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AuditStatus::Pending),
            "in_progress" => Ok(AuditStatus::InProgress),
            "done" => Ok(AuditStatus::Done),
            "error" => Ok(AuditStatus::Error),
            other => Err(AuditError::Validation(format!("unknown audit status: {}", other))),
        }
    }
}

/// Which map of the audit a stage writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultTarget {
    AuditData,
    Suggestions,
}

/// One named analysis operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Crawl,
    Links,
    Images,
    Headings,
    Meta,
    Serp,
    Ai,
    Performance,
    Score,
}

impl StageKind {
    pub const ALL: [StageKind; 9] = [
        StageKind::Crawl,
        StageKind::Links,
        StageKind::Images,
        StageKind::Headings,
        StageKind::Meta,
        StageKind::Serp,
        StageKind::Ai,
        StageKind::Performance,
        StageKind::Score,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Crawl => "crawl",
            StageKind::Links => "links",
            StageKind::Images => "images",
            StageKind::Headings => "headings",
            StageKind::Meta => "meta",
            StageKind::Serp => "serp",
            StageKind::Ai => "ai",
            StageKind::Performance => "performance",
            StageKind::Score => "score",
        }
    }

    /// Key this stage owns inside `audit_data` (or `suggestions_data`).
    pub fn result_key(&self) -> &'static str {
        match self {
            StageKind::Crawl => "crawlStats",
            StageKind::Links => "linkStats",
            StageKind::Images => "imageStats",
            StageKind::Headings => "headingsAnalysis",
            StageKind::Meta => "metaAnalysis",
            StageKind::Serp => "serp_analysis",
            StageKind::Ai => "aiSuggestions",
            StageKind::Performance => "performance_analysis",
            StageKind::Score => "seoScore",
        }
    }

    pub fn target(&self) -> ResultTarget {
        match self {
            StageKind::Ai => ResultTarget::Suggestions,
            _ => ResultTarget::AuditData,
        }
    }

    /// Stages whose results are derived from crawled pages.
    pub fn reads_pages(&self) -> bool {
        matches!(
            self,
            StageKind::Links
                | StageKind::Images
                | StageKind::Headings
                | StageKind::Meta
                | StageKind::Score
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| AuditError::Validation(format!("unknown analysis type: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Succeeded,
    /// Finished, but did not cover everything it was asked to
    Partial,
    Failed,
}

/// Per-stage bookkeeping kept alongside the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub operation_id: Uuid,
    /// Times this stage has been started on this audit
    pub runs: u32,
    pub error: Option<TaskExecutionError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of one successful stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub value: Value,
    /// False when the stage stopped short (e.g. a crawl that hit `max_pages`)
    #[serde(default = "complete_default")]
    pub complete: bool,
}

fn complete_default() -> bool {
    true
}

impl StageOutput {
    pub fn complete(value: Value) -> Self {
        Self {
            value,
            complete: true,
        }
    }

    pub fn partial(value: Value) -> Self {
        Self {
            value,
            complete: false,
        }
    }
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Audit {
    #[builder(default)]
    pub id: AuditId,
    pub url: String,
    pub owner: String,

    #[builder(default)]
    pub status: AuditStatus,

    /// Stage results keyed by stage result key
    #[builder(default)]
    pub audit_data: Map<String, Value>,
    #[builder(default)]
    pub suggestions_data: Map<String, Value>,
    #[builder(default)]
    pub stages: BTreeMap<StageKind, StageRecord>,

    /// Some stage of the current operation failed
    #[builder(default)]
    pub operation_failed: bool,
    /// Some stage of the current operation finished partially
    #[builder(default)]
    pub operation_incomplete: bool,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    pub fn result(&self, stage: StageKind) -> Option<&Value> {
        match stage.target() {
            ResultTarget::AuditData => self.audit_data.get(stage.result_key()),
            ResultTarget::Suggestions => self.suggestions_data.get(stage.result_key()),
        }
    }

    pub fn running_stages(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages
            .iter()
            .filter(|(_, r)| r.status == StageStatus::Running)
            .map(|(k, _)| *k)
    }

    pub fn snapshot(&self) -> AuditSnapshot {
        AuditSnapshot {
            id: self.id,
            url: self.url.clone(),
            status: self.status,
            audit_data: self.audit_data.clone(),
            suggestions_data: self.suggestions_data.clone(),
            stages: self.stages.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    pub id: AuditId,
    pub url: String,
    pub status: AuditStatus,
    pub audit_data: Map<String, Value>,
    pub suggestions_data: Map<String, Value>,
    pub stages: BTreeMap<StageKind, StageRecord>,
    pub updated_at: DateTime<Utc>,
}
