//! The durable workflow engine.
//!
//! A workflow is a job driven by [`WorkflowEngine`] instead of the
//! re-dispatch-per-stage orchestrator. It runs the whole stage sequence as
//! one resumable unit:
//!
//! - progress is checkpointed after every step, keyed by the job id
//! - stages may suspend on an external signal identified by a correlation id
//! - contiguous stages sharing a parallel group fan out and fan back in
//! - each stage retries in place under its own [`StageRetryPolicy`](crate::pipeline::StageRetryPolicy)

mod checkpoint;
mod engine;
mod replay;
mod signal;

#[cfg(test)]
mod integration_tests;

pub use checkpoint::{WorkflowCheckpoint, WorkflowStatus};
pub use engine::{WorkflowEngine, WorkflowOutcome};
pub use replay::{replay, NextStep, Replay};
pub use signal::{apply_signal, ReceivedSignal, SignalDisposition, SignalWait};
