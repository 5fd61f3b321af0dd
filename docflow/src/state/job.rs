//! Job lifecycle.
//!
//! A job is one execution attempt of a document through a frozen copy of its
//! campaign's pipeline. The copy is taken when the job is created so edits
//! to the campaign never reach in-flight work.

use super::{check_transition, Lifecycle};
use crate::errors::TransitionError;
use crate::pipeline::{EngineKind, PipelineDefinition};
use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Execution state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet queued.
    Pending,
    /// Waiting for a worker.
    Queued,
    /// A worker is advancing it.
    Running,
    /// Every stage completed.
    Completed,
    /// The last attempt failed.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl Lifecycle for JobState {
    const ENTITY: &'static str = "job";

    fn all() -> &'static [Self] {
        &[
            Self::Pending,
            Self::Queued,
            Self::Running,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
        ]
    }

    fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Queued, Self::Cancelled],
            Self::Queued => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Failed => &[Self::Queued],
            Self::Completed | Self::Cancelled => &[],
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of a job's ordered error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorEntry {
    /// Stage that failed.
    pub stage_id: String,
    /// Job-level attempt the error belongs to.
    pub attempt: u32,
    /// Error code (see `DocflowError::code`).
    pub code: String,
    /// Error message.
    pub message: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// One execution attempt of a document through a frozen pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job id. Doubles as the durable workflow id.
    pub id: Uuid,
    /// Owning tenant, persisted so any worker can re-bind the context.
    pub tenant_id: TenantId,
    /// Document being processed.
    pub document_id: Uuid,
    /// Campaign the pipeline was copied from.
    pub campaign_id: Uuid,
    /// Which engine drives the job.
    pub engine: EngineKind,
    /// Frozen pipeline snapshot.
    pub pipeline: PipelineDefinition,
    /// Index of the next stage to execute.
    pub cursor: usize,
    /// Current state.
    pub state: JobState,
    /// Failed attempts of the stage at `cursor`.
    pub attempts: u32,
    /// Attempts allowed per stage before the job fails.
    pub max_attempts: u32,
    /// Set when a failure must not be retried regardless of attempts left.
    #[serde(default)]
    pub final_failure: bool,
    /// Ordered error log.
    #[serde(default)]
    pub errors: Vec<JobErrorEntry>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time the job was queued.
    pub queued_at: Option<DateTime<Utc>>,
    /// Last time the job started running.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure time.
    pub failed_at: Option<DateTime<Utc>>,
    /// Cancellation time.
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job with a frozen copy of `pipeline`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        tenant_id: TenantId,
        document_id: Uuid,
        campaign_id: Uuid,
        engine: EngineKind,
        pipeline: PipelineDefinition,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            document_id,
            campaign_id,
            engine,
            pipeline,
            cursor: 0,
            state: JobState::Pending,
            attempts: 0,
            max_attempts,
            final_failure: false,
            errors: Vec::new(),
            created_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        }
    }

    /// Moves the job to `to`, applying the side effects of the target state.
    ///
    /// `Failed -> Queued` is only allowed while attempts remain.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the job untouched if the
    /// transition is not allowed.
    pub fn transition(&mut self, to: JobState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        check_transition(self.state, to)?;
        if self.state == JobState::Failed && to == JobState::Queued && !self.can_retry() {
            return Err(TransitionError::new(JobState::ENTITY, self.state, to));
        }

        match to {
            JobState::Queued => self.queued_at = Some(now),
            JobState::Running => self.started_at = Some(now),
            JobState::Completed => self.completed_at = Some(now),
            JobState::Failed => self.failed_at = Some(now),
            JobState::Cancelled => self.cancelled_at = Some(now),
            JobState::Pending => {}
        }
        self.state = to;
        Ok(())
    }

    /// Returns true if a failed job may be queued again.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        !self.final_failure && self.attempts < self.max_attempts
    }

    /// Returns true if no further work will happen for this job.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match self.state {
            JobState::Completed | JobState::Cancelled => true,
            JobState::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// Appends an entry to the error log.
    pub fn record_error(
        &mut self,
        stage_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.errors.push(JobErrorEntry {
            stage_id: stage_id.into(),
            attempt: self.attempts,
            code: code.into(),
            message: message.into(),
            at: now,
        });
    }

    /// Moves the cursor and resets the per-stage attempt counter.
    pub fn advance_to(&mut self, cursor: usize) {
        self.cursor = cursor;
        self.attempts = 0;
    }

    /// Returns true if the cursor is past the last stage.
    #[must_use]
    pub fn is_past_end(&self) -> bool {
        self.cursor >= self.pipeline.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageConfig;
    use crate::state::transition_pairs;

    fn job(max_attempts: u32) -> Job {
        Job::new(
            Uuid::new_v4(),
            TenantId::new("acme"),
            Uuid::new_v4(),
            Uuid::new_v4(),
            EngineKind::Pipeline,
            PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")]),
            max_attempts,
            Utc::now(),
        )
    }

    fn job_in(state: JobState) -> Job {
        let mut job = job(3);
        job.state = state;
        job
    }

    #[test]
    fn test_running_sets_started_at() {
        let mut job = job_in(JobState::Queued);
        let now = Utc::now();
        job.transition(JobState::Running, now).unwrap();
        assert_eq!(job.started_at, Some(now));
    }

    #[test]
    fn test_every_legal_pair_applies_side_effect() {
        let (legal, _) = transition_pairs::<JobState>();
        for (from, to) in legal {
            let mut job = job_in(from);
            let now = Utc::now();
            job.transition(to, now).unwrap();

            assert_eq!(job.state, to);
            assert_eq!(job.completed_at.is_some(), to == JobState::Completed);
            assert_eq!(job.failed_at.is_some(), to == JobState::Failed);
            assert_eq!(job.started_at.is_some(), to == JobState::Running);
        }
    }

    #[test]
    fn test_every_illegal_pair_leaves_state_untouched() {
        let (_, illegal) = transition_pairs::<JobState>();
        for (from, to) in illegal {
            let mut job = job_in(from);
            assert!(job.transition(to, Utc::now()).is_err());
            assert_eq!(job.state, from);
            assert!(job.started_at.is_none());
            assert!(job.completed_at.is_none());
        }
    }

    #[test]
    fn test_requeue_only_while_attempts_remain() {
        let mut job = job_in(JobState::Failed);
        job.attempts = 2;
        assert!(job.transition(JobState::Queued, Utc::now()).is_ok());

        let mut job = job_in(JobState::Failed);
        job.attempts = 3;
        let err = job.transition(JobState::Queued, Utc::now()).unwrap_err();
        assert_eq!(err.to, "queued");
        assert_eq!(job.state, JobState::Failed);
        assert!(job.is_finished());
    }

    #[test]
    fn test_final_failure_blocks_requeue() {
        let mut job = job_in(JobState::Failed);
        job.final_failure = true;
        assert!(job.transition(JobState::Queued, Utc::now()).is_err());
        assert!(job.is_finished());
    }

    #[test]
    fn test_advance_resets_attempts() {
        let mut job = job(3);
        job.attempts = 2;
        job.advance_to(1);
        assert_eq!(job.cursor, 1);
        assert_eq!(job.attempts, 0);
        assert!(job.is_past_end());
    }
}
