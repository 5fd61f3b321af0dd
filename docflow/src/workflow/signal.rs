//! Signal waits and received signals.

use crate::errors::TransitionError;
use crate::state::StageExecution;
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A suspended stage waiting on an external signal.
///
/// Lives in the control store so a signal arriving at any process can find
/// the tenant and workflow it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalWait {
    /// Correlation id the signal will carry.
    pub correlation_id: String,
    /// Tenant owning the workflow.
    pub tenant_id: TenantId,
    /// Durable workflow id.
    pub workflow_id: Uuid,
    /// Stage that is waiting.
    pub stage_id: String,
    /// The `Running` execution row to settle.
    pub execution_id: Uuid,
    /// When the wait was registered.
    pub registered_at: DateTime<Utc>,
    /// When the wait times out.
    pub deadline: DateTime<Utc>,
}

/// A signal as it was received, kept for idempotency and buffering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedSignal {
    /// Correlation id.
    pub correlation_id: String,
    /// Payload merged into the waiting stage's output.
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
    /// Workflow that consumed it, once consumed.
    pub consumed_by: Option<Uuid>,
}

impl ReceivedSignal {
    /// Creates an unconsumed signal.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
            received_at,
            consumed_by: None,
        }
    }

    /// Returns true if no workflow has consumed the signal yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.consumed_by.is_none()
    }
}

/// What happened to a delivered signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDisposition {
    /// A waiting workflow was resumed.
    Resumed {
        /// The resumed workflow.
        workflow_id: Uuid,
    },
    /// Nobody was waiting yet; the signal is kept for a later wait.
    Buffered,
    /// The correlation id was already signalled; nothing changed.
    Duplicate,
}

/// Completes a waiting row with the signal payload merged into its output.
///
/// Payload keys overwrite keys the stage reported itself.
pub fn apply_signal(
    execution: &mut StageExecution,
    payload: &serde_json::Map<String, serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    let mut output = execution.output.clone();
    output.extend(payload.iter().map(|(k, v)| (k.clone(), v.clone())));
    execution.complete(output, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StageExecutionState;

    #[test]
    fn test_apply_signal_merges_payload() {
        let mut row = StageExecution::new(Uuid::new_v4(), Uuid::new_v4(), "kyc", "kyc", 1, Utc::now());
        row.start(Utc::now()).unwrap();
        row.correlation_id = Some("kyc-1".into());
        row.output.insert("provider".into(), serde_json::json!("acme-id"));
        row.output.insert("status".into(), serde_json::json!("pending"));

        let mut payload = serde_json::Map::new();
        payload.insert("status".into(), serde_json::json!("verified"));
        apply_signal(&mut row, &payload, Utc::now()).unwrap();

        assert_eq!(row.state, StageExecutionState::Completed);
        assert_eq!(row.output["provider"], "acme-id");
        assert_eq!(row.output["status"], "verified");
    }

    #[test]
    fn test_apply_signal_rejects_settled_row() {
        let mut row = StageExecution::new(Uuid::new_v4(), Uuid::new_v4(), "kyc", "kyc", 1, Utc::now());
        row.start(Utc::now()).unwrap();
        row.time_out(Utc::now()).unwrap();

        assert!(apply_signal(&mut row, &serde_json::Map::new(), Utc::now()).is_err());
        assert!(row.timed_out);
    }

    #[test]
    fn test_received_signal_starts_pending() {
        let signal = ReceivedSignal::new("c", serde_json::Map::new(), Utc::now());
        assert!(signal.is_pending());
    }
}
