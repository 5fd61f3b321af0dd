//! # Docflow
//!
//! Multi-tenant document processing orchestration.
//!
//! Documents uploaded to a campaign are processed by the campaign's stage
//! pipeline, with support for:
//!
//! - **Tenant isolation**: every unit of work runs bound to one tenant's store
//! - **State machines**: documents, jobs and stage executions change state
//!   only along declared transitions
//! - **Two engines**: a re-dispatch-per-stage orchestrator and a durable,
//!   checkpointed workflow engine that can suspend on external signals
//! - **Capability registry**: stages resolve to registered capabilities, with
//!   dependency checks on every invocation
//! - **Signed notifications**: lifecycle events delivered to campaign
//!   webhooks with fixed-schedule retries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docflow::prelude::*;
//!
//! let harness = TestHarness::new();
//! harness.register(StaticCapability::new("extractor"));
//! let tenant = harness.tenant("acme").await;
//! let campaign = harness
//!     .campaign(&tenant, PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")]))
//!     .await;
//! let (_, job_id) = harness.submit(&tenant, campaign, "sha256-of-bytes").await;
//!
//! harness.run_to_completion().await;
//! assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod campaign;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod ingest;
pub mod notifications;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod state;
pub mod storage;
pub mod tenant;
pub mod testing;
pub mod utils;
pub mod worker;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::campaign::{Campaign, NotificationSettings};
    pub use crate::config::{DocflowConfig, LogFormat, LoggingConfig};
    pub use crate::context::StageContext;
    pub use crate::core::{EventType, LifecycleEvent, OutcomeStatus, StageArtifact, StageOutcome};
    pub use crate::errors::{DocflowError, StorageError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::ingest::{DocumentIntake, Submission};
    pub use crate::notifications::{
        DeliveryRecord, DeliveryStatus, NotificationEventSink, NotificationService, WebhookTransport,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        BackoffSchedule, DispatchGuard, DispatchMessage, EngineKind, EngineServices, InMemoryJobQueue, JobQueue,
        PipelineDefinition, PipelineOrchestrator, StageConfig, StageRetryPolicy, StepOutcome,
    };
    pub use crate::stages::{CapabilityRegistry, StageCapability};
    pub use crate::state::{Document, DocumentState, Job, JobState, NewDocument, StageExecution, StageExecutionState};
    pub use crate::storage::{ControlStore, InMemoryControlStore, InMemoryStoreFactory, TenantStore};
    pub use crate::tenant::{Tenant, TenantContext, TenantId, TenantManager, TenantStatus};
    pub use crate::testing::{AwaitingCapability, ScriptedCapability, StaticCapability, TestHarness};
    pub use crate::utils::{content_hash, generate_id, Clock, ManualClock, SystemClock};
    pub use crate::worker::{Worker, WorkerReport};
    pub use crate::workflow::{SignalDisposition, WorkflowCheckpoint, WorkflowEngine, WorkflowOutcome, WorkflowStatus};
}
