//! Error types for docflow.
//!
//! Every failure the orchestration layer can observe maps onto one variant of
//! [`DocflowError`]. The taxonomy entries (transition, dependency, capability,
//! stage execution, callback timeout, delivery) carry structured payloads so
//! callers can branch on them without parsing messages.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for docflow operations.
#[derive(Debug, Error)]
pub enum DocflowError {
    /// An illegal state change was requested.
    #[error("{0}")]
    TransitionNotAllowed(#[from] TransitionError),

    /// A stage prerequisite has no completed execution in the job.
    #[error("{0}")]
    DependencyViolation(#[from] DependencyViolationError),

    /// A stage references a capability that is not registered.
    #[error("Capability not found: {id}")]
    CapabilityNotFound {
        /// The unresolved capability identifier.
        id: String,
    },

    /// A stage failed while executing.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionFailure),

    /// An external signal never arrived before its deadline.
    #[error("Callback timeout: stage '{stage_id}' waited on correlation id '{correlation_id}'")]
    CallbackTimeout {
        /// The stage that was waiting.
        stage_id: String,
        /// The correlation id that never arrived.
        correlation_id: String,
    },

    /// An outbound notification could not be delivered.
    #[error("{0}")]
    Delivery(#[from] DeliveryFailure),

    /// A pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// Tenant-scoped storage was touched outside of any tenant binding.
    #[error("No tenant context is bound to the current execution")]
    TenantContextMissing,

    /// A tenant exists but cannot be bound (unknown, suspended, archived).
    #[error("Tenant '{tenant_id}' is unavailable: {reason}")]
    TenantUnavailable {
        /// The tenant id.
        tenant_id: String,
        /// Why the tenant cannot be bound.
        reason: String,
    },

    /// A storage operation failed.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// Capability registration failed.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocflowError {
    /// Creates a capability-not-found error.
    #[must_use]
    pub fn capability_not_found(id: impl Into<String>) -> Self {
        Self::CapabilityNotFound { id: id.into() }
    }

    /// Creates a tenant-unavailable error.
    #[must_use]
    pub fn tenant_unavailable(tenant_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TenantUnavailable {
            tenant_id: tenant_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns a stable machine-readable code for the error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransitionNotAllowed(_) => "TRANSITION_NOT_ALLOWED",
            Self::DependencyViolation(_) => "DEPENDENCY_VIOLATION",
            Self::CapabilityNotFound { .. } => "CAPABILITY_NOT_FOUND",
            Self::StageExecution(_) => "STAGE_EXECUTION_FAILURE",
            Self::CallbackTimeout { .. } => "CALLBACK_TIMEOUT",
            Self::Delivery(_) => "DELIVERY_FAILURE",
            Self::Validation(_) => "PIPELINE_INVALID",
            Self::TenantContextMissing => "TENANT_CONTEXT_MISSING",
            Self::TenantUnavailable { .. } => "TENANT_UNAVAILABLE",
            Self::Storage(_) => "STORAGE",
            Self::Registry(_) => "REGISTRY",
            Self::Config(_) => "CONFIG",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns true if the orchestration layer may retry the failed work.
    ///
    /// Only stage execution failures that the stage itself marked retryable
    /// qualify. Configuration errors, dependency violations and callback
    /// timeouts are terminal for the job.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StageExecution(failure) if failure.retryable)
    }
}

/// Metadata attached to validation errors for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a state machine rejects a transition.
///
/// The entity is left untouched when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Transition not allowed for {entity}: {from} -> {to}")]
pub struct TransitionError {
    /// The kind of entity ("document", "job", ...).
    pub entity: &'static str,
    /// The current state.
    pub from: String,
    /// The requested state.
    pub to: String,
}

impl TransitionError {
    /// Creates a new transition error.
    #[must_use]
    pub fn new(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Error raised when a stage runs before its prerequisites completed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dependency violation: stage '{stage_id}' requires completed {}", missing.join(", "))]
pub struct DependencyViolationError {
    /// The stage that could not run.
    pub stage_id: String,
    /// The prerequisites without a completed execution.
    pub missing: Vec<String>,
}

impl DependencyViolationError {
    /// Creates a new dependency violation.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, missing: Vec<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            missing,
        }
    }
}

/// A domain failure reported by (or raised around) a stage capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage_id}' failed on attempt {attempt}: {message}")]
pub struct StageExecutionFailure {
    /// The failing stage.
    pub stage_id: String,
    /// The attempt number (1-based).
    pub attempt: u32,
    /// The failure message.
    pub message: String,
    /// Whether a retry may succeed.
    pub retryable: bool,
}

impl StageExecutionFailure {
    /// Creates a new stage execution failure.
    #[must_use]
    pub fn new(
        stage_id: impl Into<String>,
        attempt: u32,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            attempt,
            message: message.into(),
            retryable,
        }
    }
}

/// A failed notification delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Delivery {delivery_id} attempt {attempt} failed: {reason}")]
pub struct DeliveryFailure {
    /// The stable delivery id shared by all attempts.
    pub delivery_id: Uuid,
    /// The attempt number (1-based).
    pub attempt: u32,
    /// Response status if the endpoint answered.
    pub status: Option<u16>,
    /// Why the attempt failed.
    pub reason: String,
}

/// Errors raised by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The entity kind.
        entity: &'static str,
        /// The missing id.
        id: String,
    },

    /// A record with the same id already exists.
    #[error("{entity} already exists: {id}")]
    Conflict {
        /// The entity kind.
        entity: &'static str,
        /// The conflicting id.
        id: String,
    },

    /// The record is terminal and can no longer change.
    #[error("{entity} {id} is immutable once terminal")]
    ImmutableRecord {
        /// The entity kind.
        entity: &'static str,
        /// The record id.
        id: String,
    },

    /// The backing store could not be reached; the operation may succeed
    /// later.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        Self::Conflict {
            entity,
            id: id.to_string(),
        }
    }
}

/// Error raised when a pipeline definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Creates the error reported for a dependency cycle.
    #[must_use]
    pub fn cycle(cycle_path: Vec<String>) -> Self {
        let path = cycle_path.join(" -> ");
        let info = ErrorInfo::new(
            "PIPELINE-CYCLE",
            format!("Pipeline contains a dependency cycle: {path}"),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            message: format!("Cycle detected in pipeline: {path}"),
            stages: cycle_path,
            error_info: Some(info),
        }
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}
