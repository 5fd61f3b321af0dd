//! Lifecycle events emitted on state changes.

use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kinds of lifecycle events.
///
/// The string forms (`"document.completed"`, ...) are what campaigns list in
/// their enabled notification events and what goes in the event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A document finished every stage.
    #[serde(rename = "document.completed")]
    DocumentCompleted,
    /// A document failed terminally.
    #[serde(rename = "document.failed")]
    DocumentFailed,
    /// A document was cancelled.
    #[serde(rename = "document.cancelled")]
    DocumentCancelled,
    /// A stage execution completed.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A stage execution failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A stage was skipped by its guard.
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// A failed job was scheduled for another attempt.
    #[serde(rename = "job.retry_scheduled")]
    JobRetryScheduled,
    /// A workflow suspended waiting on a signal.
    #[serde(rename = "workflow.suspended")]
    WorkflowSuspended,
    /// A suspended workflow was resumed by a signal.
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
}

impl EventType {
    /// Every event type.
    pub const ALL: [Self; 9] = [
        Self::DocumentCompleted,
        Self::DocumentFailed,
        Self::DocumentCancelled,
        Self::StageCompleted,
        Self::StageFailed,
        Self::StageSkipped,
        Self::JobRetryScheduled,
        Self::WorkflowSuspended,
        Self::WorkflowResumed,
    ];

    /// Returns the dotted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DocumentCompleted => "document.completed",
            Self::DocumentFailed => "document.failed",
            Self::DocumentCancelled => "document.cancelled",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::StageSkipped => "stage.skipped",
            Self::JobRetryScheduled => "job.retry_scheduled",
            Self::WorkflowSuspended => "workflow.suspended",
            Self::WorkflowResumed => "workflow.resumed",
        }
    }

    /// Returns true for events that end a document's processing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::DocumentCompleted | Self::DocumentFailed | Self::DocumentCancelled
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

/// A lifecycle event, scoped to one tenant and campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Campaign the document belongs to.
    pub campaign_id: Uuid,
    /// Document concerned.
    pub document_id: Uuid,
    /// Job concerned.
    pub job_id: Uuid,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl LifecycleEvent {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(
        kind: EventType,
        tenant_id: TenantId,
        campaign_id: Uuid,
        document_id: Uuid,
        job_id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            tenant_id,
            campaign_id,
            document_id,
            job_id,
            occurred_at,
            data: serde_json::Map::new(),
        }
    }

    /// Creates an event describing `job`.
    #[must_use]
    pub fn for_job(kind: EventType, job: &crate::state::Job, occurred_at: DateTime<Utc>) -> Self {
        Self::new(
            kind,
            job.tenant_id.clone(),
            job.campaign_id,
            job.document_id,
            job.id,
            occurred_at,
        )
    }

    /// Adds a data field.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the JSON body sent to notification endpoints.
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "event": self.kind.as_str(),
            "document_id": self.document_id,
            "job_id": self.job_id,
            "campaign_id": self.campaign_id,
            "occurred_at": self.occurred_at.to_rfc3339(),
            "data": self.data,
        })
    }
}
