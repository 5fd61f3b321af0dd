//! Stage execution lifecycle.
//!
//! Each run of a stage inside a job is one [`StageExecution`] row. Retries
//! append new rows; rows that reached a terminal state are never modified
//! again, which keeps the audit trail append-only.

use super::{check_transition, Lifecycle};
use crate::core::StageArtifact;
use crate::errors::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// State of one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageExecutionState {
    /// Row created, capability not yet invoked.
    Pending,
    /// Capability invoked (or waiting on an external signal).
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Not run because its guard did not match.
    Skipped,
}

impl Lifecycle for StageExecutionState {
    const ENTITY: &'static str = "stage_execution";

    fn all() -> &'static [Self] {
        &[
            Self::Pending,
            Self::Running,
            Self::Completed,
            Self::Failed,
            Self::Skipped,
        ]
    }

    fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Running, Self::Skipped],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed | Self::Skipped => &[],
        }
    }
}

impl fmt::Display for StageExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Resource-cost counters reported by a capability (pages, tokens, calls...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceUsage {
    counters: BTreeMap<String, u64>,
}

impl ResourceUsage {
    /// Creates an empty usage record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to a counter.
    #[must_use]
    pub fn with(mut self, counter: impl Into<String>, amount: u64) -> Self {
        self.add(counter, amount);
        self
    }

    /// Adds `amount` to a counter in place.
    pub fn add(&mut self, counter: impl Into<String>, amount: u64) {
        let entry = self.counters.entry(counter.into()).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    /// Folds another usage record into this one.
    pub fn merge(&mut self, other: &Self) {
        for (name, amount) in &other.counters {
            self.add(name.clone(), *amount);
        }
    }

    /// Returns a counter value.
    #[must_use]
    pub fn get(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    /// Returns true if no counters were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// One recorded run of one stage within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    /// Row id.
    pub id: Uuid,
    /// Job the run belongs to.
    pub job_id: Uuid,
    /// Stage identifier within the pipeline.
    pub stage_id: String,
    /// Capability that ran it.
    pub capability: String,
    /// Attempt number for this stage (1-based).
    pub attempt: u32,
    /// Current state.
    pub state: StageExecutionState,
    /// Input snapshot (outputs of prior stages the stage saw).
    pub input: serde_json::Value,
    /// Stage config snapshot.
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Output payload.
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,
    /// Binary artifacts produced.
    #[serde(default)]
    pub artifacts: Vec<StageArtifact>,
    /// Resource usage counters.
    #[serde(default)]
    pub usage: ResourceUsage,
    /// Error message for failed runs.
    pub error: Option<String>,
    /// Correlation id the run is (or was) waiting on.
    pub correlation_id: Option<String>,
    /// Set when the run failed because its signal never arrived.
    #[serde(default)]
    pub timed_out: bool,
    /// Reason for a skipped run.
    pub skip_reason: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall time between start and finish.
    pub duration_ms: Option<i64>,
}

impl StageExecution {
    /// Creates a pending row.
    #[must_use]
    pub fn new(
        id: Uuid,
        job_id: Uuid,
        stage_id: impl Into<String>,
        capability: impl Into<String>,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_id,
            stage_id: stage_id.into(),
            capability: capability.into(),
            attempt,
            state: StageExecutionState::Pending,
            input: serde_json::Value::Null,
            config: serde_json::Map::new(),
            output: serde_json::Map::new(),
            artifacts: Vec::new(),
            usage: ResourceUsage::default(),
            error: None,
            correlation_id: None,
            timed_out: false,
            skip_reason: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Attaches input and config snapshots.
    #[must_use]
    pub fn with_snapshots(
        mut self,
        input: serde_json::Value,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.input = input;
        self.config = config;
        self
    }

    fn transition(&mut self, to: StageExecutionState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        check_transition(self.state, to)?;
        match to {
            StageExecutionState::Running => self.started_at = Some(now),
            StageExecutionState::Completed | StageExecutionState::Failed => {
                self.finished_at = Some(now);
                self.duration_ms = self.started_at.map(|started| (now - started).num_milliseconds());
            }
            StageExecutionState::Skipped => self.finished_at = Some(now),
            StageExecutionState::Pending => {}
        }
        self.state = to;
        Ok(())
    }

    /// Pending -> Running.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(StageExecutionState::Running, now)
    }

    /// Running -> Completed, storing the output.
    pub fn complete(
        &mut self,
        output: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(StageExecutionState::Completed, now)?;
        self.output = output;
        Ok(())
    }

    /// Running -> Failed, storing the error.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(StageExecutionState::Failed, now)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Running -> Failed with the callback-timeout marker set.
    pub fn time_out(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let correlation = self.correlation_id.clone().unwrap_or_default();
        self.fail(format!("callback timeout waiting on '{correlation}'"), now)?;
        self.timed_out = true;
        self.output
            .insert("timed_out".to_string(), serde_json::Value::Bool(true));
        Ok(())
    }

    /// Pending -> Skipped.
    pub fn skip(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(StageExecutionState::Skipped, now)?;
        self.skip_reason = Some(reason.into());
        Ok(())
    }

    /// Returns true once the row can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if the run is waiting on an external signal.
    #[must_use]
    pub fn is_awaiting_signal(&self) -> bool {
        self.state == StageExecutionState::Running && self.correlation_id.is_some()
    }
}
