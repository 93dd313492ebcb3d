//! Stage registry for dispatching analysis stages.
//!
//! Maps each [`StageKind`] to its fully wrapped unit of work, so the dispatcher
//! never knows how a stage is built.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::StageKind;
use crate::task::UnitOfWork;

/// Registry of stage implementations.
///
/// # Example
///
/// ```ignore
/// let mut registry = StageRegistry::new();
/// registry.register(
///     StageKind::Images,
///     TaskWrapper::new(Arc::new(ImagesStage)).scoped(pool.clone()).build(),
/// );
/// ```
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn UnitOfWork>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the unit that runs `stage`. A later registration replaces an
    /// earlier one.
    pub fn register(&mut self, stage: StageKind, unit: Arc<dyn UnitOfWork>) {
        self.stages.insert(stage, unit);
    }

    pub fn get(&self, stage: StageKind) -> Option<Arc<dyn UnitOfWork>> {
        self.stages.get(&stage).cloned()
    }

    pub fn is_registered(&self, stage: StageKind) -> bool {
        self.stages.contains_key(&stage)
    }

    /// Registered stages in pipeline order.
    pub fn stages(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|s| self.stages.contains_key(s))
            .collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedStageRegistry = Arc<StageRegistry>;
