//! Core domain model types shared by both engines.
//!
//! - Stage outcomes returned by capabilities
//! - Binary artifacts produced by stages
//! - Lifecycle events emitted on state changes

mod artifact;
mod event;
mod outcome;

pub use artifact::StageArtifact;
pub use event::{EventType, LifecycleEvent};
pub use outcome::{OutcomeStatus, StageOutcome};
