//! In-memory audit kernel around a scripted site.
//!
//! Every backend is in-process, so tests need no containers and can run with
//! paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use seo_audit::kernel::{AuditKernel, KernelComponents};
use seo_audit::testing::MockFetcher;
use seo_audit::{Audit, AuditId, AuditSnapshot, Config, OperationStatus, StageKind};
use serde_json::{json, Value};

pub const OWNER: &str = "owner-1";

/// Defaults with short retry waits and no crawl throttling.
pub fn test_config() -> Config {
    Config {
        retry_min_wait: Duration::from_millis(10),
        retry_max_wait: Duration::from_millis(50),
        crawl_requests_per_second: 1000,
        crawl_chunk_size: 2,
        ..Config::default()
    }
}

pub struct TestHarness {
    pub kernel: AuditKernel,
    pub site: Arc<MockFetcher>,
}

impl TestHarness {
    pub fn new(site: MockFetcher) -> Self {
        Self::with_config(site, test_config())
    }

    pub fn with_config(site: MockFetcher, config: Config) -> Self {
        let site = Arc::new(site);
        Self::with_components(site.clone(), config, KernelComponents::in_memory(site))
    }

    pub fn with_components(
        site: Arc<MockFetcher>,
        config: Config,
        components: KernelComponents,
    ) -> Self {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let kernel =
            AuditKernel::with_components(&config, components).expect("Failed to build kernel");
        Self { kernel, site }
    }

    pub async fn audit(&self, url: &str) -> Audit {
        self.kernel
            .repository
            .create_audit(url, OWNER)
            .await
            .expect("Failed to create audit")
    }

    /// Submit a stage and wait for it to finish.
    pub async fn run(&self, audit_id: AuditId, stage: StageKind, args: Value) -> OperationStatus {
        self.kernel
            .dispatcher
            .submit_analysis_with(OWNER, audit_id, stage, args)
            .await
            .expect("Failed to submit stage")
            .wait()
            .await
    }

    pub async fn run_default(&self, audit_id: AuditId, stage: StageKind) -> OperationStatus {
        self.run(audit_id, stage, json!({})).await
    }

    pub async fn snapshot(&self, audit_id: AuditId) -> AuditSnapshot {
        self.kernel
            .dispatcher
            .get_audit_snapshot(audit_id)
            .await
            .expect("Failed to load snapshot")
    }
}

pub fn assert_succeeded(status: &OperationStatus) {
    assert!(
        matches!(status, OperationStatus::Succeeded { .. }),
        "expected success, got {:?}",
        status
    );
}
