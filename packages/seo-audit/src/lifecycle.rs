//! Audit lifecycle state machine.
//!
//! Pure transitions over an [`Audit`]; no I/O. The storage layer applies
//! these under the per-audit lock, together with the stage's result merge.
//!
//! ```text
//! pending ──start──▶ in_progress ──all stages finished──▶ done | error
//!                        ▲                                     │
//!                        └──────── start (new operation) ──────┘
//! ```
//!
//! An operation is the set of stages running together. It ends when no stage
//! is running; the aggregate then becomes `error` if any of its stages failed,
//! stays `in_progress` if any finished partially, and is `done` otherwise.
//! `done` and `error` only close the operation: starting another stage opens
//! a new one without touching earlier results.
//!
//! Finish events carry the operation id they belong to. One that does not
//! match the stage's recorded operation is stale and changes nothing.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::TaskExecutionError;
use crate::models::{Audit, AuditStatus, ResultTarget, StageKind, StageRecord, StageStatus};

#[derive(Debug, Clone)]
pub enum AuditEvent {
    StageStarted {
        stage: StageKind,
        operation_id: Uuid,
    },
    StageSucceeded {
        stage: StageKind,
        operation_id: Uuid,
        value: Value,
        complete: bool,
    },
    StageFailed {
        stage: StageKind,
        operation_id: Uuid,
        error: TaskExecutionError,
    },
}

impl AuditEvent {
    fn stage(&self) -> StageKind {
        match self {
            AuditEvent::StageStarted { stage, .. }
            | AuditEvent::StageSucceeded { stage, .. }
            | AuditEvent::StageFailed { stage, .. } => *stage,
        }
    }
}

/// True when a finish event belongs to another run than the recorded one.
fn is_stale(audit: &Audit, event: &AuditEvent) -> bool {
    let operation_id = match event {
        AuditEvent::StageStarted { .. } => return false,
        AuditEvent::StageSucceeded { operation_id, .. }
        | AuditEvent::StageFailed { operation_id, .. } => *operation_id,
    };
    audit
        .stages
        .get(&event.stage())
        .is_some_and(|record| record.operation_id != operation_id)
}

/// Apply one event, returning the aggregate status afterwards.
pub fn apply(audit: &mut Audit, event: AuditEvent, now: DateTime<Utc>) -> AuditStatus {
    if is_stale(audit, &event) {
        debug!(audit_id = %audit.id, stage = %event.stage(), "Ignoring finish of a superseded run");
        return audit.status;
    }

    match event {
        AuditEvent::StageStarted {
            stage,
            operation_id,
        } => {
            if audit.running_stages().next().is_none() {
                // New operation; earlier results stay, earlier verdicts don't
                audit.operation_failed = false;
                audit.operation_incomplete = false;
                audit.status = AuditStatus::InProgress;
            }
            let runs = audit.stages.get(&stage).map_or(0, |r| r.runs) + 1;
            audit.stages.insert(
                stage,
                StageRecord {
                    status: StageStatus::Running,
                    operation_id,
                    runs,
                    error: None,
                    started_at: now,
                    finished_at: None,
                },
            );
        }
        AuditEvent::StageSucceeded {
            stage,
            operation_id,
            value,
            complete,
        } => {
            let map = match stage.target() {
                ResultTarget::AuditData => &mut audit.audit_data,
                ResultTarget::Suggestions => &mut audit.suggestions_data,
            };
            map.insert(stage.result_key().to_string(), value);

            let status = if complete {
                StageStatus::Succeeded
            } else {
                audit.operation_incomplete = true;
                StageStatus::Partial
            };
            finish(audit, stage, operation_id, status, None, now);
        }
        AuditEvent::StageFailed {
            stage,
            operation_id,
            error,
        } => {
            audit.operation_failed = true;
            finish(audit, stage, operation_id, StageStatus::Failed, Some(error), now);
        }
    }

    audit.updated_at = now;
    audit.status
}

fn finish(
    audit: &mut Audit,
    stage: StageKind,
    operation_id: Uuid,
    status: StageStatus,
    error: Option<TaskExecutionError>,
    now: DateTime<Utc>,
) {
    match audit.stages.get_mut(&stage) {
        Some(record) => {
            record.status = status;
            record.error = error;
            record.finished_at = Some(now);
        }
        None => {
            // Finished without a recorded start (e.g. merged by an external writer)
            audit.stages.insert(
                stage,
                StageRecord {
                    status,
                    operation_id,
                    runs: 1,
                    error,
                    started_at: now,
                    finished_at: Some(now),
                },
            );
        }
    }

    if audit.running_stages().next().is_some() {
        return;
    }

    let next = if audit.operation_failed {
        AuditStatus::Error
    } else if audit.operation_incomplete {
        AuditStatus::InProgress
    } else {
        AuditStatus::Done
    };
    debug!(audit_id = %audit.id, from = %audit.status, to = %next, "Operation finished");
    audit.status = next;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    fn audit() -> Audit {
        Audit::builder()
            .url("https://example.com")
            .owner("owner-1")
            .build()
    }

    fn start(audit: &mut Audit, stage: StageKind) -> AuditStatus {
        apply(
            audit,
            AuditEvent::StageStarted {
                stage,
                operation_id: Uuid::now_v7(),
            },
            Utc::now(),
        )
    }

    fn current_run(audit: &Audit, stage: StageKind) -> Uuid {
        audit.stages[&stage].operation_id
    }

    fn succeed(audit: &mut Audit, stage: StageKind, value: Value) -> AuditStatus {
        let operation_id = current_run(audit, stage);
        apply(
            audit,
            AuditEvent::StageSucceeded {
                stage,
                operation_id,
                value,
                complete: true,
            },
            Utc::now(),
        )
    }

    fn fail(audit: &mut Audit, stage: StageKind) -> AuditStatus {
        let operation_id = current_run(audit, stage);
        apply(
            audit,
            AuditEvent::StageFailed {
                stage,
                operation_id,
                error: failure(stage),
            },
            Utc::now(),
        )
    }

    fn succeed_partially(audit: &mut Audit, stage: StageKind) -> AuditStatus {
        let operation_id = current_run(audit, stage);
        apply(
            audit,
            AuditEvent::StageSucceeded {
                stage,
                operation_id,
                value: json!({"truncated": true}),
                complete: false,
            },
            Utc::now(),
        )
    }

    fn failure(stage: StageKind) -> TaskExecutionError {
        TaskExecutionError {
            task_name: stage.name().to_string(),
            error_type: "TransientDependencyError".to_string(),
            error_message: "503".to_string(),
            kind: ErrorKind::Retryable,
        }
    }

    #[test]
    fn test_single_stage_operation() {
        let mut audit = audit();
        assert_eq!(start(&mut audit, StageKind::Meta), AuditStatus::InProgress);
        assert_eq!(
            succeed(&mut audit, StageKind::Meta, json!({"titleLength": 10})),
            AuditStatus::Done
        );
        assert_eq!(audit.audit_data["metaAnalysis"], json!({"titleLength": 10}));
    }

    #[test]
    fn test_done_waits_for_every_running_stage() {
        let mut audit = audit();
        start(&mut audit, StageKind::Links);
        start(&mut audit, StageKind::Images);
        assert_eq!(
            succeed(&mut audit, StageKind::Links, json!({})),
            AuditStatus::InProgress
        );
        assert_eq!(
            succeed(&mut audit, StageKind::Images, json!({})),
            AuditStatus::Done
        );
    }

    #[test]
    fn test_failure_keeps_other_stage_data() {
        let mut audit = audit();
        start(&mut audit, StageKind::Links);
        start(&mut audit, StageKind::Serp);
        succeed(&mut audit, StageKind::Links, json!({"broken": 1}));
        let status = fail(&mut audit, StageKind::Serp);

        assert_eq!(status, AuditStatus::Error);
        assert_eq!(audit.audit_data["linkStats"], json!({"broken": 1}));
        assert_eq!(audit.stages[&StageKind::Links].status, StageStatus::Succeeded);
        assert_eq!(audit.stages[&StageKind::Serp].status, StageStatus::Failed);
    }

    #[test]
    fn test_reanalysis_reenters_in_progress() {
        let mut audit = audit();
        start(&mut audit, StageKind::Serp);
        fail(&mut audit, StageKind::Serp);
        assert_eq!(audit.status, AuditStatus::Error);

        assert_eq!(start(&mut audit, StageKind::Serp), AuditStatus::InProgress);
        assert_eq!(
            succeed(&mut audit, StageKind::Serp, json!({"results": []})),
            AuditStatus::Done
        );
        assert_eq!(audit.stages[&StageKind::Serp].runs, 2);
        assert!(audit.stages[&StageKind::Serp].error.is_none());
    }

    #[test]
    fn test_partial_stage_keeps_in_progress() {
        let mut audit = audit();
        start(&mut audit, StageKind::Crawl);
        let status = succeed_partially(&mut audit, StageKind::Crawl);
        assert_eq!(status, AuditStatus::InProgress);
        assert_eq!(audit.stages[&StageKind::Crawl].status, StageStatus::Partial);
    }

    #[test]
    fn test_operation_after_partial_crawl_can_finish() {
        let mut audit = audit();
        start(&mut audit, StageKind::Crawl);
        succeed_partially(&mut audit, StageKind::Crawl);

        start(&mut audit, StageKind::Meta);
        assert_eq!(
            succeed(&mut audit, StageKind::Meta, json!({})),
            AuditStatus::Done
        );
    }

    #[test]
    fn test_suggestions_go_to_their_own_map() {
        let mut audit = audit();
        start(&mut audit, StageKind::Ai);
        succeed(&mut audit, StageKind::Ai, json!(["Add a meta description"]));
        assert!(audit.audit_data.is_empty());
        assert!(audit.suggestions_data.contains_key("aiSuggestions"));
    }

    #[test]
    fn test_superseded_run_cannot_finish_the_stage() {
        let mut audit = audit();
        let first = Uuid::now_v7();
        apply(
            &mut audit,
            AuditEvent::StageStarted {
                stage: StageKind::Crawl,
                operation_id: first,
            },
            Utc::now(),
        );
        start(&mut audit, StageKind::Crawl);
        let updated_at = audit.updated_at;

        let status = apply(
            &mut audit,
            AuditEvent::StageSucceeded {
                stage: StageKind::Crawl,
                operation_id: first,
                value: json!({"pagesCrawled": 9}),
                complete: true,
            },
            Utc::now(),
        );
        assert_eq!(status, AuditStatus::InProgress);
        assert_eq!(audit.stages[&StageKind::Crawl].status, StageStatus::Running);
        assert!(!audit.audit_data.contains_key("crawlStats"));
        assert_eq!(audit.updated_at, updated_at);

        let status = apply(
            &mut audit,
            AuditEvent::StageFailed {
                stage: StageKind::Crawl,
                operation_id: first,
                error: failure(StageKind::Crawl),
            },
            Utc::now(),
        );
        assert_eq!(status, AuditStatus::InProgress);
        assert!(!audit.operation_failed);

        assert_eq!(
            succeed(&mut audit, StageKind::Crawl, json!({"pagesCrawled": 3})),
            AuditStatus::Done
        );
    }
}
