//! Dispatching analysis stages against audits.
//!
//! ```text
//! submit_analysis(actor, audit, stage)
//!     │
//!     ├─► ActivityMonitor (blocked actors are refused)
//!     ├─► security limiter (per actor)
//!     ├─► StageRegistry (stage → wrapped unit of work)
//!     ├─► in-flight map (one operation per audit and stage)
//!     └─► spawn: worker permit → begin_stage → run under time limit
//!                 → complete_stage | fail_stage → OperationHandle
//! ```
//!
//! Each submission is one operation with its own [`OperationHandle`]. The
//! handle can be awaited or cancelled; cancellation and the soft time limit
//! both abort the unit of work in flight.

mod dispatcher;
mod registry;

pub use dispatcher::{DispatcherConfig, OperationHandle, OperationStatus, TaskDispatcher};
pub use registry::{SharedStageRegistry, StageRegistry};
