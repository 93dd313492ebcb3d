use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::{FetchError, FetchResult, FetchedPage, PageFetcher, ProbeResult};
use crate::dependencies::GuardedDependency;

/// Fetcher wrapper that retries transient failures and keeps one breaker per
/// target host (`fetch:{host}`).
pub struct GuardedFetcher {
    inner: Arc<dyn PageFetcher>,
    guard: GuardedDependency,
}

impl GuardedFetcher {
    pub fn new(inner: Arc<dyn PageFetcher>, guard: GuardedDependency) -> Self {
        Self { inner, guard }
    }

    fn dependency(url: &Url) -> FetchResult<String> {
        url.host_str()
            .map(|host| format!("fetch:{}", host))
            .ok_or_else(|| FetchError::InvalidUrl(format!("{} has no host", url)))
    }
}

#[async_trait]
impl PageFetcher for GuardedFetcher {
    async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage> {
        let dependency = Self::dependency(url)?;
        let inner = self.inner.as_ref();
        self.guard
            .call(&dependency, move || inner.fetch(url))
            .await
    }

    async fn probe(&self, url: &Url) -> FetchResult<ProbeResult> {
        let dependency = Self::dependency(url)?;
        let inner = self.inner.as_ref();
        self.guard
            .call(&dependency, move || inner.probe(url))
            .await
    }
}
