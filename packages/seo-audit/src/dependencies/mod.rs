//! External analysis dependencies: language model and SERP provider.
//!
//! Both are traits so stages can be tested against mocks. Every real call goes
//! through [`GuardedDependency`], which adds bounded retries and a per-dependency
//! circuit breaker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use task_guard::{CircuitError, Transient};
use thiserror::Error;

mod guarded;
mod openai;
mod serp;

pub use guarded::GuardedDependency;
pub use openai::OpenAiChat;
pub use serp::HttpSerpProvider;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("{dependency} network error: {message}")]
    Network { dependency: String, message: String },

    #[error("{dependency} returned HTTP {status}: {body}")]
    Status {
        dependency: String,
        status: u16,
        body: String,
    },

    #[error("{dependency} returned an unusable response: {message}")]
    InvalidResponse { dependency: String, message: String },

    #[error("circuit open for {dependency}")]
    CircuitOpen { dependency: String },
}

impl DependencyError {
    pub fn dependency(&self) -> &str {
        match self {
            DependencyError::Network { dependency, .. }
            | DependencyError::Status { dependency, .. }
            | DependencyError::InvalidResponse { dependency, .. }
            | DependencyError::CircuitOpen { dependency } => dependency,
        }
    }
}

impl Transient for DependencyError {
    fn is_transient(&self) -> bool {
        match self {
            DependencyError::Network { .. } | DependencyError::CircuitOpen { .. } => true,
            DependencyError::Status { status, .. } => *status >= 500 || *status == 429,
            DependencyError::InvalidResponse { .. } => false,
        }
    }
}

impl From<CircuitError<DependencyError>> for DependencyError {
    fn from(err: CircuitError<DependencyError>) -> Self {
        match err {
            CircuitError::Open { dependency } => DependencyError::CircuitOpen { dependency },
            CircuitError::Inner(e) => e,
        }
    }
}

/// Chat-style text completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, DependencyError>;
}

/// One organic search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerpResult {
    pub position: u32,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait SerpProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SerpResult>, DependencyError>;
}
