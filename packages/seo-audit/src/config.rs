use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres audit store; in-memory store when unset
    pub database_url: Option<String>,
    /// Redis key-value store; in-memory store when unset
    pub redis_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub serp_api_url: Option<String>,
    pub serp_api_key: Option<String>,
    pub browser_render_url: Option<String>,

    // Task execution
    pub task_soft_time_limit: Duration,
    pub crawl_soft_time_limit: Duration,
    pub task_max_retries: u32,
    pub task_rate_limit: usize,
    pub task_rate_window: Duration,
    pub worker_concurrency: usize,
    pub storage_pool_size: usize,

    // Security-facing limiter
    pub rate_limit_max_requests: usize,
    pub rate_limit_window: Duration,

    // Cache
    pub cache_ttl: Duration,
    pub performance_cache_ttl: Duration,

    // Crawling
    pub crawl_max_pages: usize,
    pub crawl_depth_limit: usize,
    pub crawl_chunk_size: usize,
    pub crawl_requests_per_second: u32,
    pub user_agent: String,

    // Dependency calls
    pub retry_max_attempts: u32,
    pub retry_min_wait: Duration,
    pub retry_max_wait: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            serp_api_url: None,
            serp_api_key: None,
            browser_render_url: None,
            task_soft_time_limit: Duration::from_secs(1800),
            crawl_soft_time_limit: Duration::from_secs(3600),
            task_max_retries: 3,
            task_rate_limit: 10,
            task_rate_window: Duration::from_secs(60),
            worker_concurrency: 4,
            storage_pool_size: 10,
            rate_limit_max_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(3600),
            performance_cache_ttl: Duration::from_secs(300),
            crawl_max_pages: 30,
            crawl_depth_limit: 2,
            crawl_chunk_size: 100,
            crawl_requests_per_second: 2,
            user_agent: "SeoAuditBot/1.0".to_string(),
            retry_max_attempts: 3,
            retry_min_wait: Duration::from_millis(500),
            retry_max_wait: Duration::from_secs(10),
            breaker_failure_threshold: 5,
            breaker_recovery: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();

        Ok(Self {
            database_url: optional("DATABASE_URL"),
            redis_url: optional("REDIS_URL"),
            openai_api_key: optional("OPENAI_API_KEY"),
            openai_model: env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            serp_api_url: optional("SERP_API_URL"),
            serp_api_key: optional("SERP_API_KEY"),
            browser_render_url: optional("BROWSER_RENDER_URL"),
            task_soft_time_limit: secs("TASK_SOFT_TIME_LIMIT_SECS", defaults.task_soft_time_limit)?,
            crawl_soft_time_limit: secs("CRAWL_SOFT_TIME_LIMIT_SECS", defaults.crawl_soft_time_limit)?,
            task_max_retries: parsed("TASK_MAX_RETRIES", defaults.task_max_retries)?,
            task_rate_limit: parsed("TASK_RATE_LIMIT", defaults.task_rate_limit)?,
            task_rate_window: secs("TASK_RATE_WINDOW_SECS", defaults.task_rate_window)?,
            worker_concurrency: parsed("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            storage_pool_size: parsed("STORAGE_POOL_SIZE", defaults.storage_pool_size)?,
            rate_limit_max_requests: parsed("RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit_max_requests)?,
            rate_limit_window: secs("RATE_LIMIT_WINDOW_SECS", defaults.rate_limit_window)?,
            cache_ttl: secs("CACHE_TTL_SECS", defaults.cache_ttl)?,
            performance_cache_ttl: secs("PERFORMANCE_CACHE_TTL_SECS", defaults.performance_cache_ttl)?,
            crawl_max_pages: parsed("CRAWL_MAX_PAGES", defaults.crawl_max_pages)?,
            crawl_depth_limit: parsed("CRAWL_DEPTH_LIMIT", defaults.crawl_depth_limit)?,
            crawl_chunk_size: parsed("CRAWL_CHUNK_SIZE", defaults.crawl_chunk_size)?,
            crawl_requests_per_second: parsed("CRAWL_REQUESTS_PER_SECOND", defaults.crawl_requests_per_second)?,
            user_agent: env::var("USER_AGENT").unwrap_or(defaults.user_agent),
            retry_max_attempts: parsed("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_min_wait: millis("RETRY_MIN_WAIT_MS", defaults.retry_min_wait)?,
            retry_max_wait: millis("RETRY_MAX_WAIT_MS", defaults.retry_max_wait)?,
            breaker_failure_threshold: parsed("BREAKER_FAILURE_THRESHOLD", defaults.breaker_failure_threshold)?,
            breaker_recovery: secs("BREAKER_RECOVERY_SECS", defaults.breaker_recovery)?,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn secs(name: &str, default: Duration) -> Result<Duration> {
    parsed(name, default.as_secs()).map(Duration::from_secs)
}

fn millis(name: &str, default: Duration) -> Result<Duration> {
    parsed(name, default.as_millis() as u64).map(Duration::from_millis)
}
