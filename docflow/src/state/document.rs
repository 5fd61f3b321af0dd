//! Document lifecycle.

use super::{check_transition, Lifecycle};
use crate::errors::TransitionError;
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Processing state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    /// Uploaded, not yet handed to an engine.
    Pending,
    /// Waiting for a worker.
    Queued,
    /// A job is working on it.
    Processing,
    /// All stages completed.
    Completed,
    /// Processing failed terminally.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl Lifecycle for DocumentState {
    const ENTITY: &'static str = "document";

    fn all() -> &'static [Self] {
        &[
            Self::Pending,
            Self::Queued,
            Self::Processing,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
        ]
    }

    fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Queued, Self::Cancelled],
            Self::Queued => &[Self::Processing, Self::Cancelled],
            Self::Processing => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of a document's append-only processing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// State before the transition.
    pub from: DocumentState,
    /// State after the transition.
    pub to: DocumentState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Optional free-form note (failure message, job id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Inputs supplied by the upload collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    /// Campaign whose pipeline processes the document.
    pub campaign_id: Uuid,
    /// Original file name.
    pub filename: String,
    /// Integrity hash of the content.
    pub content_hash: String,
    /// Where the bytes live.
    pub storage_locator: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Caller-supplied metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One uploaded artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Campaign the document was uploaded to.
    pub campaign_id: Uuid,
    /// Original file name.
    pub filename: String,
    /// Integrity hash of the content.
    pub content_hash: String,
    /// Where the bytes live.
    pub storage_locator: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Current state.
    pub state: DocumentState,
    /// How many times processing was retried.
    pub retry_count: u32,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Append-only transition history.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set when the document completes.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the document fails.
    pub failed_at: Option<DateTime<Utc>>,
    /// Failure message, if failed.
    pub failure_message: Option<String>,
}

impl Document {
    /// Creates a pending document for a tenant.
    #[must_use]
    pub fn new(id: Uuid, tenant_id: TenantId, input: NewDocument, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id,
            campaign_id: input.campaign_id,
            filename: input.filename,
            content_hash: input.content_hash,
            storage_locator: input.storage_locator,
            mime_type: input.mime_type,
            size_bytes: input.size_bytes,
            state: DocumentState::Pending,
            retry_count: 0,
            metadata: input.metadata,
            history: Vec::new(),
            created_at: now,
            completed_at: None,
            failed_at: None,
            failure_message: None,
        }
    }

    /// Moves the document to `to`, applying the side effects of the target
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the document untouched if the
    /// transition is not in the table.
    pub fn transition(
        &mut self,
        to: DocumentState,
        now: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<(), TransitionError> {
        check_transition(self.state, to)?;

        match to {
            DocumentState::Completed => self.completed_at = Some(now),
            DocumentState::Failed => {
                self.failed_at = Some(now);
                self.failure_message = note.clone();
            }
            _ => {}
        }

        self.history.push(HistoryEntry {
            from: self.state,
            to,
            at: now,
            note,
        });
        self.state = to;
        Ok(())
    }

    /// Pending -> Queued.
    pub fn queue(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(DocumentState::Queued, now, None)
    }

    /// Queued -> Processing.
    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(DocumentState::Processing, now, None)
    }

    /// Processing -> Completed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(DocumentState::Completed, now, None)
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, now: DateTime<Utc>, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(DocumentState::Failed, now, Some(message.into()))
    }

    /// Any non-terminal state -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(DocumentState::Cancelled, now, None)
    }

    /// Returns true if the document reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::transition_pairs;

    fn document() -> Document {
        Document::new(
            Uuid::new_v4(),
            TenantId::new("acme"),
            NewDocument {
                campaign_id: Uuid::new_v4(),
                filename: "invoice.pdf".into(),
                content_hash: "abc".into(),
                storage_locator: "s3://bucket/invoice.pdf".into(),
                mime_type: "application/pdf".into(),
                size_bytes: 1024,
                metadata: HashMap::new(),
            },
            Utc::now(),
        )
    }

    fn document_in(state: DocumentState) -> Document {
        let mut doc = document();
        doc.state = state;
        doc
    }

    #[test]
    fn test_happy_path() {
        let mut doc = document();
        let now = Utc::now();

        doc.queue(now).unwrap();
        doc.start_processing(now).unwrap();
        doc.complete(now).unwrap();

        assert_eq!(doc.state, DocumentState::Completed);
        assert_eq!(doc.completed_at, Some(now));
        assert_eq!(doc.history.len(), 3);
        assert!(doc.is_terminal());
    }

    #[test]
    fn test_fail_records_message_and_timestamp() {
        let mut doc = document_in(DocumentState::Processing);
        let now = Utc::now();

        doc.fail(now, "validate exhausted retries").unwrap();

        assert_eq!(doc.failed_at, Some(now));
        assert_eq!(doc.failure_message.as_deref(), Some("validate exhausted retries"));
        assert!(doc.completed_at.is_none());
    }

    #[test]
    fn test_every_legal_pair_applies_once() {
        let (legal, _) = transition_pairs::<DocumentState>();
        for (from, to) in legal {
            let mut doc = document_in(from);
            let now = Utc::now();
            doc.transition(to, now, Some("note".into())).unwrap();

            assert_eq!(doc.state, to);
            assert_eq!(doc.history.len(), 1);
            assert_eq!(doc.completed_at.is_some(), to == DocumentState::Completed);
            assert_eq!(doc.failed_at.is_some(), to == DocumentState::Failed);
        }
    }

    #[test]
    fn test_every_illegal_pair_leaves_state_untouched() {
        let (_, illegal) = transition_pairs::<DocumentState>();
        for (from, to) in illegal {
            let mut doc = document_in(from);
            let err = doc.transition(to, Utc::now(), None).unwrap_err();

            assert_eq!(err.entity, "document");
            assert_eq!(doc.state, from);
            assert!(doc.history.is_empty());
            assert!(doc.completed_at.is_none());
            assert!(doc.failed_at.is_none());
        }
    }

    #[test]
    fn test_cancel_from_every_non_terminal_state() {
        for &state in DocumentState::all() {
            let mut doc = document_in(state);
            let result = doc.cancel(Utc::now());
            assert_eq!(result.is_ok(), !state.is_terminal(), "from {state}");
        }
    }
}
