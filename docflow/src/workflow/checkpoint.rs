//! Durable workflow checkpoints.

use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Coarse status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// A worker is (or will be) executing steps.
    Running,
    /// Parked until a signal arrives or its deadline passes.
    Suspended,
    /// Every stage finished.
    Completed,
    /// Failed terminally.
    Failed,
    /// Cancelled.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns true once the workflow can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress of one workflow, keyed by its durable id (the job id).
///
/// The stage execution rows remain the source of truth; the checkpoint is
/// what an operator (or a resuming worker) reads to see where the workflow
/// stands without replaying them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    /// Durable workflow id.
    pub workflow_id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Index of the first stage of the step in progress (or the pipeline
    /// length once finished).
    pub position: usize,
    /// Stages the workflow has moved past, in order.
    #[serde(default)]
    pub completed_stages: Vec<String>,
    /// Correlation ids currently awaited.
    #[serde(default)]
    pub awaiting: Vec<String>,
    /// Current status.
    pub status: WorkflowStatus,
    /// Bumped on every save.
    pub sequence: u64,
    /// Last save time.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    /// A fresh checkpoint at position zero.
    #[must_use]
    pub fn new(workflow_id: Uuid, tenant_id: TenantId, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            tenant_id,
            position: 0,
            completed_stages: Vec::new(),
            awaiting: Vec::new(),
            status: WorkflowStatus::Running,
            sequence: 0,
            updated_at: now,
        }
    }

    /// Stamps the checkpoint for the next save.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.sequence += 1;
        self.updated_at = now;
    }

    /// Returns true if the workflow is parked on a signal.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.status == WorkflowStatus::Suspended
    }
}
