use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use task_guard::{ActivityMonitor, CacheManager, SlidingWindowLimiter};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::SharedStageRegistry;
use crate::config::Config;
use crate::error::{AuditError, AuditResult, TaskExecutionError};
use crate::models::{AuditId, AuditSnapshot, AuditStatus, StageKind};
use crate::storage::AuditRepository;
use crate::task::{UnitOfWork, WorkContext, WorkUnit};

const SUBMIT_ACTION: &str = "submit_analysis";
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Operations running at once; the rest wait queued
    pub worker_concurrency: usize,
    pub task_soft_time_limit: Duration,
    pub crawl_soft_time_limit: Duration,
    /// Submissions allowed per actor per `rate_limit_window`
    pub rate_limit_max_requests: usize,
    pub rate_limit_window: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_concurrency: config.worker_concurrency.max(1),
            task_soft_time_limit: config.task_soft_time_limit,
            crawl_soft_time_limit: config.crawl_soft_time_limit,
            rate_limit_max_requests: config.rate_limit_max_requests,
            rate_limit_window: config.rate_limit_window,
        }
    }

    fn time_limit(&self, stage: StageKind) -> Duration {
        match stage {
            StageKind::Crawl => self.crawl_soft_time_limit,
            _ => self.task_soft_time_limit,
        }
    }
}

/// Where an operation is in its life.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    /// Waiting for a worker
    Queued,
    Running,
    /// Result merged; `status` is the audit's aggregate status afterwards
    Succeeded { status: AuditStatus, complete: bool },
    Failed(TaskExecutionError),
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded { .. } | OperationStatus::Failed(_) | OperationStatus::Cancelled
        )
    }
}

/// Caller's view of one submitted stage run.
#[derive(Clone, Debug)]
pub struct OperationHandle {
    pub id: Uuid,
    pub audit_id: AuditId,
    pub stage: StageKind,
    status: watch::Receiver<OperationStatus>,
    cancel: CancellationToken,
}

impl OperationHandle {
    pub fn status(&self) -> OperationStatus {
        self.status.borrow().clone()
    }

    /// Wait for the operation to finish.
    pub async fn wait(&self) -> OperationStatus {
        let mut status = self.status.clone();
        let finished = status
            .wait_for(OperationStatus::is_terminal)
            .await
            .map(|s| s.clone());
        match finished {
            Ok(s) => s,
            Err(_) => status.borrow().clone(),
        }
    }

    /// Request cancellation. Queued operations never start; running ones are
    /// aborted and recorded as cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Maps (audit, stage) submissions onto wrapped units of work and runs them
/// in the background.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SharedStageRegistry,
    repository: AuditRepository,
    cache: Arc<CacheManager>,
    security_limiter: Arc<SlidingWindowLimiter>,
    activity: Arc<ActivityMonitor>,
    workers: Semaphore,
    config: DispatcherConfig,
    operations: DashMap<Uuid, CancellationToken>,
    /// One queued or running operation per (audit, stage)
    in_flight: DashMap<(AuditId, StageKind), Uuid>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl TaskDispatcher {
    pub fn new(
        registry: SharedStageRegistry,
        repository: AuditRepository,
        cache: Arc<CacheManager>,
        security_limiter: Arc<SlidingWindowLimiter>,
        activity: Arc<ActivityMonitor>,
        config: DispatcherConfig,
    ) -> Self {
        info!(
            worker_concurrency = config.worker_concurrency,
            stages = registry.stages().len(),
            "dispatcher starting"
        );
        Self {
            inner: Arc::new(Inner {
                registry,
                repository,
                cache,
                security_limiter,
                activity,
                workers: Semaphore::new(config.worker_concurrency.max(1)),
                config,
                operations: DashMap::new(),
                in_flight: DashMap::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn repository(&self) -> &AuditRepository {
        &self.inner.repository
    }

    /// Stages that can be submitted.
    pub fn stages(&self) -> Vec<StageKind> {
        self.inner.registry.stages()
    }

    /// Submit `stage` for `audit_id` with default arguments.
    pub async fn submit_analysis(
        &self,
        actor: &str,
        audit_id: AuditId,
        stage: StageKind,
    ) -> AuditResult<OperationHandle> {
        self.submit_analysis_with(actor, audit_id, stage, json!({}))
            .await
    }

    /// Submit `stage` for `audit_id`.
    ///
    /// Refused with `RateLimitExceeded` when the actor is blocked or over the
    /// submission limit, `Validation` when the stage is not available or the
    /// arguments are not an object, `NotFound` for an unknown audit, and
    /// `StageBusy` while the same stage is queued or running for the audit.
    pub async fn submit_analysis_with(
        &self,
        actor: &str,
        audit_id: AuditId,
        stage: StageKind,
        args: Value,
    ) -> AuditResult<OperationHandle> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AuditError::Cancelled);
        }
        if !args.is_object() {
            return Err(AuditError::Validation(
                "analysis arguments must be a JSON object".to_string(),
            ));
        }

        self.admit(actor, audit_id, stage).await?;

        let audit = self.inner.repository.load_audit(audit_id).await?;
        let unit = self.inner.registry.get(stage).ok_or_else(|| {
            AuditError::Validation(format!("analysis type {} is not available", stage))
        })?;

        let id = Uuid::now_v7();
        match self.inner.in_flight.entry((audit.id, stage)) {
            Entry::Occupied(running) => {
                let operation_id = *running.get();
                warn!(
                    audit_id = %audit.id,
                    stage = %stage,
                    operation_id = %operation_id,
                    "Stage already in flight, submission refused"
                );
                return Err(AuditError::StageBusy {
                    stage,
                    operation_id,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let cancel = self.inner.shutdown.child_token();
        let (tx, rx) = watch::channel(OperationStatus::Queued);
        self.inner.operations.insert(id, cancel.clone());
        info!(
            operation_id = %id,
            audit_id = %audit.id,
            stage = %stage,
            actor = %actor,
            "Analysis submitted"
        );

        let work = WorkUnit::new(stage.name(), audit.id, args);
        let inner = self.inner.clone();
        let op_cancel = cancel.clone();
        tokio::spawn(async move {
            let audit_id = work.audit_id;
            let status = inner.drive(id, stage, unit, work, &op_cancel, &tx).await;
            inner.in_flight.remove_if(&(audit_id, stage), |_, running| *running == id);
            inner.operations.remove(&id);
            let _ = tx.send(status);
        });

        Ok(OperationHandle {
            id,
            audit_id: audit.id,
            stage,
            status: rx,
            cancel,
        })
    }

    /// Activity check, per-actor limit, then record the attempt.
    ///
    /// The limiter rejects when its window is full, but a limiter or activity
    /// store outage is logged and the request let through.
    async fn admit(&self, actor: &str, audit_id: AuditId, stage: StageKind) -> AuditResult<()> {
        let inner = &self.inner;

        match inner.activity.is_blocked(actor).await {
            Ok(true) => {
                warn!(actor = %actor, stage = %stage, "Blocked actor refused");
                return Err(AuditError::RateLimitExceeded {
                    key: actor.to_string(),
                });
            }
            Ok(false) => {}
            Err(e) => warn!(actor = %actor, error = %e, "Activity store unavailable, skipping block check"),
        }

        match inner
            .security_limiter
            .allow(
                actor,
                inner.config.rate_limit_max_requests,
                inner.config.rate_limit_window,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    actor = %actor,
                    limit = inner.config.rate_limit_max_requests,
                    window_secs = inner.config.rate_limit_window.as_secs(),
                    "Submission rate limit exceeded"
                );
                return Err(AuditError::RateLimitExceeded {
                    key: actor.to_string(),
                });
            }
            Err(e) => warn!(actor = %actor, error = %e, "Rate limiter store unavailable, allowing request"),
        }

        let details = json!({ "audit_id": audit_id.to_string(), "stage": stage.name() });
        if let Err(e) = inner.activity.log_activity(actor, SUBMIT_ACTION, details).await {
            warn!(actor = %actor, error = %e, "Failed to record activity");
        }
        Ok(())
    }

    pub async fn get_audit_snapshot(&self, audit_id: AuditId) -> AuditResult<AuditSnapshot> {
        Ok(self.inner.repository.load_audit(audit_id).await?.snapshot())
    }

    /// Drop every cached stage result of an audit. Returns the number of
    /// entries removed.
    pub async fn invalidate_cache(&self, audit_id: AuditId) -> AuditResult<usize> {
        self.inner.repository.load_audit(audit_id).await?;
        let removed = self.inner.cache.invalidate_scope(audit_id).await?;
        info!(audit_id = %audit_id, removed, "Audit cache invalidated");
        Ok(removed)
    }

    /// Cancel an operation by id. Returns false if it already finished.
    pub fn cancel(&self, operation_id: Uuid) -> bool {
        match self.inner.operations.get(&operation_id) {
            Some(token) => {
                token.cancel();
                info!(operation_id = %operation_id, "Operation cancel requested");
                true
            }
            None => false,
        }
    }

    /// Queued plus running operations.
    pub fn active_operations(&self) -> usize {
        self.inner.operations.len()
    }

    /// Stop accepting submissions, give running operations `grace` to finish,
    /// then cancel the rest. Returns how many had to be cancelled.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        info!(
            active = self.active_operations(),
            grace_secs = grace.as_secs(),
            "dispatcher shutting down"
        );

        if self.drained_within(grace).await {
            info!("dispatcher stopped");
            return 0;
        }

        let remaining = self.active_operations();
        warn!(remaining, "Grace period elapsed, cancelling operations");
        self.inner.shutdown.cancel();
        if !self.drained_within(grace).await {
            error!(remaining = self.active_operations(), "Operations still running after cancel");
        }
        remaining
    }

    async fn drained_within(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while !self.inner.operations.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }
}

impl Inner {
    async fn drive(
        &self,
        id: Uuid,
        stage: StageKind,
        unit: Arc<dyn UnitOfWork>,
        work: WorkUnit,
        cancel: &CancellationToken,
        status: &watch::Sender<OperationStatus>,
    ) -> OperationStatus {
        let audit_id = work.audit_id;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(operation_id = %id, audit_id = %audit_id, stage = %stage, "Operation cancelled before start");
                return OperationStatus::Cancelled;
            }
            permit = self.workers.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return OperationStatus::Cancelled,
            },
        };

        if let Err(e) = self.repository.begin_stage(audit_id, stage, id).await {
            let error = e.into_task_error(stage.name());
            error!(
                operation_id = %id,
                audit_id = %audit_id,
                stage = %stage,
                error = %error,
                "Failed to start stage"
            );
            return OperationStatus::Failed(error);
        }
        status.send_replace(OperationStatus::Running);
        debug!(operation_id = %id, audit_id = %audit_id, stage = %stage, "Stage running");

        let limit = self.config.time_limit(stage);
        let ctx = WorkContext::new(cancel.clone());
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuditError::Cancelled),
            result = tokio::time::timeout(limit, unit.run(&work, &ctx)) => {
                result.unwrap_or_else(|_| Err(AuditError::TimedOut(limit)))
            }
        };

        let output = match outcome {
            Ok(output) => output,
            Err(e) => return self.record_failure(id, stage, audit_id, e).await,
        };

        let complete = output.complete;
        match self
            .repository
            .complete_stage(audit_id, stage, id, output)
            .await
        {
            Ok(aggregate) => {
                info!(
                    operation_id = %id,
                    audit_id = %audit_id,
                    stage = %stage,
                    complete,
                    status = %aggregate,
                    "Stage succeeded"
                );
                if stage == StageKind::Crawl {
                    self.invalidate_dependents(audit_id).await;
                }
                OperationStatus::Succeeded {
                    status: aggregate,
                    complete,
                }
            }
            Err(e) => self.record_failure(id, stage, audit_id, e).await,
        }
    }

    /// Record the failure against the stage; earlier results stay untouched.
    async fn record_failure(
        &self,
        id: Uuid,
        stage: StageKind,
        audit_id: AuditId,
        err: AuditError,
    ) -> OperationStatus {
        let error = err.into_task_error(stage.name());
        match self
            .repository
            .fail_stage(audit_id, stage, id, error.clone())
            .await
        {
            Ok(aggregate) => warn!(
                operation_id = %id,
                audit_id = %audit_id,
                stage = %stage,
                error_type = %error.error_type,
                error_message = %error.error_message,
                status = %aggregate,
                "Stage failed"
            ),
            Err(e) => error!(
                operation_id = %id,
                audit_id = %audit_id,
                stage = %stage,
                error = %e,
                "Failed to record stage failure"
            ),
        }

        if error.error_type == AuditError::Cancelled.error_type() {
            OperationStatus::Cancelled
        } else {
            OperationStatus::Failed(error)
        }
    }

    /// A fresh crawl makes every page-derived cached result stale.
    async fn invalidate_dependents(&self, audit_id: AuditId) {
        for stage in StageKind::ALL.into_iter().filter(|s| *s != StageKind::Crawl) {
            let pattern = format!("{}:{}:*", stage.name(), audit_id);
            if let Err(e) = self.cache.invalidate(&pattern).await {
                warn!(audit_id = %audit_id, stage = %stage, error = %e, "Failed to invalidate cached results");
            }
        }
    }
}
