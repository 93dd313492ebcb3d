// AuditKernel - every process-wide component, built once at startup
//
// Stores, limiters, cache, breakers and the stage registry are constructed
// here and passed down explicitly. Swapping a backend or a dependency for a
// test double means building different KernelComponents.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use task_guard::{
    ActivityMonitor, BreakerConfig, CacheManager, ChunkedProcessor, CircuitRegistry, Clock,
    KeyValueStore, MemoryStore, RetryPolicy, SlidingWindowLimiter, StoreFailurePolicy,
    SystemClock,
};
use tracing::info;

use crate::config::Config;
use crate::crawler::{CrawlConfig, Crawler};
use crate::dependencies::{
    GuardedDependency, HttpSerpProvider, LanguageModel, OpenAiChat, SerpProvider,
};
use crate::error::AuditResult;
use crate::fetch::{BrowserRenderer, GuardedFetcher, HttpFetcher, PageFetcher, RemoteBrowser};
use crate::models::StageKind;
use crate::pipeline::{DispatcherConfig, StageRegistry, TaskDispatcher};
use crate::stages::{
    AiSuggestionsStage, CrawlStage, HeadingsStage, ImagesStage, LinksStage, MetaStage,
    PerformanceStage, ScoreStage, SerpStage,
};
use crate::storage::{AuditRepository, AuditStore, MemoryAuditStore};
use crate::task::{RateLimit, StoragePool, TaskWrapper, UnitOfWork};

/// Backends and external dependencies the kernel is assembled from.
pub struct KernelComponents {
    pub audit_store: Arc<dyn AuditStore>,
    /// Backs the limiters, the cache and the activity monitor
    pub kv_store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub browser: Option<Arc<dyn BrowserRenderer>>,
    /// The ai stage is only registered when a model is configured
    pub language_model: Option<Arc<dyn LanguageModel>>,
    /// The serp stage is only registered when a provider is configured
    pub serp_provider: Option<Arc<dyn SerpProvider>>,
}

impl KernelComponents {
    /// In-memory stores around the given fetcher; no optional dependencies.
    pub fn in_memory(fetcher: Arc<dyn PageFetcher>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            audit_store: Arc::new(MemoryAuditStore::new()),
            kv_store: Arc::new(MemoryStore::new(clock.clone())),
            clock,
            fetcher,
            browser: None,
            language_model: None,
            serp_provider: None,
        }
    }
}

/// AuditKernel holds the assembled pipeline.
pub struct AuditKernel {
    pub repository: AuditRepository,
    pub dispatcher: TaskDispatcher,
    pub cache: Arc<CacheManager>,
    pub activity: Arc<ActivityMonitor>,
    pub breakers: Arc<CircuitRegistry>,
    pub storage_pool: Arc<StoragePool>,
}

impl AuditKernel {
    /// Connect the configured backends and build the kernel.
    pub async fn from_config(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let audit_store = audit_store(&config).await?;
        let kv_store = kv_store(&config, clock.clone()).await?;

        let fetcher = HttpFetcher::new(&config.user_agent).context("Failed to build HTTP client")?;
        let browser = config
            .browser_render_url
            .as_deref()
            .map(|url| Arc::new(RemoteBrowser::new(url)) as Arc<dyn BrowserRenderer>);
        let language_model = config.openai_api_key.as_deref().map(|key| {
            Arc::new(OpenAiChat::new(key, config.openai_model.as_str())) as Arc<dyn LanguageModel>
        });
        let serp_provider = config.serp_api_url.as_deref().map(|url| {
            let provider = match config.serp_api_key.as_deref() {
                Some(key) => HttpSerpProvider::new(url).with_api_key(key),
                None => HttpSerpProvider::new(url),
            };
            Arc::new(provider) as Arc<dyn SerpProvider>
        });

        let components = KernelComponents {
            audit_store,
            kv_store,
            clock,
            fetcher: Arc::new(fetcher),
            browser,
            language_model,
            serp_provider,
        };
        Self::with_components(&config, components).context("Failed to assemble audit kernel")
    }

    pub fn with_components(config: &Config, components: KernelComponents) -> AuditResult<Self> {
        let KernelComponents {
            audit_store,
            kv_store,
            clock,
            fetcher,
            browser,
            language_model,
            serp_provider,
        } = components;

        let breakers = Arc::new(CircuitRegistry::new(
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                recovery_timeout: config.breaker_recovery,
            },
            clock.clone(),
        ));
        let guard = GuardedDependency::new(
            RetryPolicy::new(config.retry_max_attempts)
                .with_wait(config.retry_min_wait, config.retry_max_wait),
            breakers.clone(),
        );

        let cache = Arc::new(
            CacheManager::new(kv_store.clone(), "cache").with_default_ttl(config.cache_ttl),
        );
        // Background work must not stall on a limiter store outage
        let task_limiter = Arc::new(
            SlidingWindowLimiter::new(kv_store.clone(), clock.clone(), "task_limit")
                .with_failure_policy(StoreFailurePolicy::FailOpen),
        );
        let security_limiter = Arc::new(SlidingWindowLimiter::new(
            kv_store.clone(),
            clock.clone(),
            "rate_limit",
        ));
        let activity = Arc::new(ActivityMonitor::new(kv_store, clock));

        let repository = AuditRepository::new(audit_store);
        let storage_pool = Arc::new(StoragePool::new(
            repository.clone(),
            config.storage_pool_size,
        ));

        // First run plus the configured retries
        let task_retry = RetryPolicy::new(config.task_max_retries.saturating_add(1))
            .with_wait(config.retry_min_wait, config.retry_max_wait);
        let rate = RateLimit::new(config.task_rate_limit, config.task_rate_window);
        let wrap = |unit: Arc<dyn UnitOfWork>, ttl: Option<Duration>| {
            let mut wrapper = TaskWrapper::new(unit)
                .rate_limited(task_limiter.clone(), rate.clone())
                .scoped(storage_pool.clone())
                .retrying(task_retry.clone());
            if let Some(ttl) = ttl {
                wrapper = wrapper.cached(cache.clone(), ttl);
            }
            wrapper.build()
        };

        // Every page fetch retries transient failures behind a per-host breaker
        let pages: Arc<dyn PageFetcher> = Arc::new(GuardedFetcher::new(fetcher, guard.clone()));

        let requests_per_second =
            NonZeroU32::new(config.crawl_requests_per_second).unwrap_or(NonZeroU32::MIN);
        let mut crawler = Crawler::new(pages.clone(), requests_per_second);
        if let Some(browser) = browser {
            crawler = crawler.with_browser(browser);
        }
        let crawl_defaults = CrawlConfig::builder()
            .max_pages(config.crawl_max_pages)
            .depth_limit(config.crawl_depth_limit)
            .build();
        let chunks = ChunkedProcessor::new(config.crawl_chunk_size)?;

        let page_ttl = Some(config.cache_ttl);
        let mut registry = StageRegistry::new();
        // Crawling replaces stored pages; it is never served from cache
        registry.register(
            StageKind::Crawl,
            wrap(
                Arc::new(CrawlStage::new(Arc::new(crawler), chunks, crawl_defaults)),
                None,
            ),
        );
        registry.register(
            StageKind::Links,
            wrap(Arc::new(LinksStage::new(pages.clone())), page_ttl),
        );
        registry.register(StageKind::Images, wrap(Arc::new(ImagesStage), page_ttl));
        registry.register(StageKind::Headings, wrap(Arc::new(HeadingsStage), page_ttl));
        registry.register(StageKind::Meta, wrap(Arc::new(MetaStage), page_ttl));
        registry.register(
            StageKind::Performance,
            wrap(
                Arc::new(PerformanceStage::new(pages)),
                Some(config.performance_cache_ttl),
            ),
        );
        // The score reads other stages' results, so a cached one would go stale
        registry.register(StageKind::Score, wrap(Arc::new(ScoreStage), None));
        if let Some(provider) = serp_provider {
            registry.register(
                StageKind::Serp,
                wrap(Arc::new(SerpStage::new(provider, guard.clone())), page_ttl),
            );
        }
        if let Some(model) = language_model {
            registry.register(
                StageKind::Ai,
                wrap(Arc::new(AiSuggestionsStage::new(model, guard)), page_ttl),
            );
        }

        info!(
            stages = ?registry.stages(),
            storage_pool_size = storage_pool.size(),
            task_rate_limit = config.task_rate_limit,
            "Audit kernel assembled"
        );

        let dispatcher = TaskDispatcher::new(
            Arc::new(registry),
            repository.clone(),
            cache.clone(),
            security_limiter,
            activity.clone(),
            DispatcherConfig::from_config(config),
        );

        Ok(Self {
            repository,
            dispatcher,
            cache,
            activity,
            breakers,
            storage_pool,
        })
    }

    /// Drain the dispatcher, then close the storage pool. Returns how many
    /// operations had to be cancelled.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let cancelled = self.dispatcher.shutdown(grace).await;
        self.storage_pool.close();
        info!(cancelled, "Audit kernel stopped");
        cancelled
    }
}

async fn audit_store(config: &Config) -> Result<Arc<dyn AuditStore>> {
    match config.database_url.as_deref() {
        None => Ok(Arc::new(MemoryAuditStore::new())),
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = crate::storage::PostgresAuditStore::connect(
                url,
                config.storage_pool_size as u32,
            )
            .await
            .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            info!("Using Postgres audit store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("DATABASE_URL is set but the postgres feature is disabled"),
    }
}

async fn kv_store(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn KeyValueStore>> {
    match config.redis_url.as_deref() {
        None => Ok(Arc::new(MemoryStore::new(clock))),
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = task_guard::RedisStore::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            info!("Using Redis key-value store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("REDIS_URL is set but the redis feature is disabled"),
    }
}
