//! Stage outcome type with factory methods.

use super::StageArtifact;
use crate::state::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a capability reports after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The stage finished and produced its output.
    Succeeded,
    /// The stage failed.
    Failed,
    /// The stage handed work to an external party and must wait for a signal.
    AwaitingSignal,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::AwaitingSignal => write!(f, "awaiting_signal"),
        }
    }
}

/// The result of invoking a stage capability.
///
/// Outcomes are immutable once built; use the factory methods and the
/// `with_*` builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Outcome status.
    pub status: OutcomeStatus,

    /// Output payload, visible to later stages.
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,

    /// Binary artifacts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<StageArtifact>,

    /// Resource-cost counters.
    #[serde(default)]
    pub usage: ResourceUsage,

    /// Error message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether a failure may succeed on retry.
    #[serde(default)]
    pub retryable: bool,

    /// Correlation id of the awaited signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Deadline override for the awaited signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_timeout: Option<Duration>,
}

impl StageOutcome {
    fn base(status: OutcomeStatus) -> Self {
        Self {
            status,
            output: serde_json::Map::new(),
            artifacts: Vec::new(),
            usage: ResourceUsage::default(),
            error: None,
            retryable: false,
            correlation_id: None,
            signal_timeout: None,
        }
    }

    /// Creates a successful outcome with an output payload.
    #[must_use]
    pub fn success(output: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            output,
            ..Self::base(OutcomeStatus::Succeeded)
        }
    }

    /// Creates a successful outcome with no output.
    #[must_use]
    pub fn success_empty() -> Self {
        Self::base(OutcomeStatus::Succeeded)
    }

    /// Creates a successful outcome with a single output value.
    #[must_use]
    pub fn success_value(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut output = serde_json::Map::new();
        output.insert(key.into(), value);
        Self::success(output)
    }

    /// Creates a failure that the engines may retry.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            retryable: true,
            ..Self::base(OutcomeStatus::Failed)
        }
    }

    /// Creates a failure that must not be retried.
    #[must_use]
    pub fn fail_permanent(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            retryable: false,
            ..Self::base(OutcomeStatus::Failed)
        }
    }

    /// Requests suspension until a signal with `correlation_id` arrives.
    #[must_use]
    pub fn await_signal(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::base(OutcomeStatus::AwaitingSignal)
        }
    }

    /// Overrides the signal deadline.
    #[must_use]
    pub fn with_signal_timeout(mut self, timeout: Duration) -> Self {
        self.signal_timeout = Some(timeout);
        self
    }

    /// Adds artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<StageArtifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Sets the resource usage.
    #[must_use]
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Merges keys into the output payload.
    #[must_use]
    pub fn with_output(mut self, output: serde_json::Map<String, serde_json::Value>) -> Self {
        self.output.extend(output);
        self
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }

    /// Returns true if the stage is waiting on a signal.
    #[must_use]
    pub fn is_awaiting_signal(&self) -> bool {
        self.status == OutcomeStatus::AwaitingSignal
    }

    /// Returns a value from the output payload.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.output.get(key)
    }
}
