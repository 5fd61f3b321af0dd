//! Pipeline definitions and the baseline orchestrator.
//!
//! This module provides:
//! - Stage configs and pipeline definitions with validation
//! - Conditional routing and stage guards
//! - Stage and job retry policies
//! - The dispatch queue and the idempotent dispatch guard
//! - The re-dispatch-per-stage [`PipelineOrchestrator`]

mod dag;
mod definition;
pub mod executor;
mod guard;
mod orchestrator;
mod queue;
mod retry;
pub mod routing;
mod services;


pub use dag::{find_cycle, topological_order};
pub use definition::{BranchRule, EngineKind, PipelineDefinition, StageConfig};
pub use guard::{DispatchGuard, DispatchLease};
pub use orchestrator::{PipelineOrchestrator, StepOutcome};
pub use queue::{DispatchMessage, InMemoryJobQueue, JobQueue, QueuedMessage};
pub use retry::{BackoffSchedule, BackoffStrategy, JitterStrategy, StageRetryPolicy};
pub use routing::{CompareOp, Condition};
pub use services::EngineServices;
