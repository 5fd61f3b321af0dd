//! Baseline orchestrator: one stage per dispatch.
//!
//! Each [`DispatchMessage::PipelineStep`] runs exactly one stage (or one
//! skipped stage) of a job and then either re-enqueues the job for the next
//! stage, schedules a retry of the same stage after the job backoff, or
//! finishes the job and its document. Nothing is kept in memory between
//! dispatches: the cursor, attempt counter and error log live on the job.

use super::executor::{self, StageRun};
use super::{DispatchMessage, EngineKind, EngineServices, StageConfig};
use crate::config::OrchestratorConfig;
use crate::context::StageContext;
use crate::core::{EventType, OutcomeStatus, StageOutcome};
use crate::errors::{DocflowError, StageExecutionFailure};
use crate::observability::JobSpanAttributes;
use crate::state::{Document, DocumentState, Job, JobState};
use crate::tenant::{TenantContext, TenantId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// What one dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Another dispatch holds the job; nothing ran.
    Busy,
    /// The job was not runnable (finished, cancelled or not queued).
    Ignored,
    /// The stage finished (or was skipped) and the next one was enqueued.
    Advanced {
        /// Stage that runs next.
        next_stage: String,
    },
    /// The last stage finished; job and document are completed.
    Completed,
    /// The stage failed and the job was re-queued.
    RetryScheduled {
        /// Failed attempts so far at this cursor.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// The job and document failed terminally.
    Failed,
    /// Cancellation was recorded while the stage ran; the job stops here.
    Cancelled,
}

/// The re-dispatch-per-stage engine.
#[derive(Debug, Clone)]
pub struct PipelineOrchestrator {
    services: EngineServices,
    config: OrchestratorConfig,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(services: EngineServices, config: OrchestratorConfig) -> Self {
        Self { services, config }
    }

    /// Runs the next step of a job under its tenant's binding.
    ///
    /// # Errors
    ///
    /// Storage and tenant-binding failures. Stage failures are not errors;
    /// they are recorded on the job and reported through [`StepOutcome`].
    pub async fn dispatch(&self, tenant_id: &TenantId, job_id: Uuid) -> Result<StepOutcome, DocflowError> {
        let message = DispatchMessage::PipelineStep {
            tenant_id: tenant_id.clone(),
            job_id,
        };
        let span = JobSpanAttributes::new(EngineKind::Pipeline, tenant_id, job_id).span();
        let step = self.services.tenants.run(tenant_id, self.step(job_id)).instrument(span);
        match self.services.guard.run_exclusive(message.dispatch_key(), step).await? {
            Some(outcome) => outcome,
            None => {
                debug!(tenant_id = %tenant_id, job_id = %job_id, "Dispatch already in flight");
                Ok(StepOutcome::Busy)
            }
        }
    }

    async fn step(&self, job_id: Uuid) -> Result<StepOutcome, DocflowError> {
        let tenant = TenantContext::require()?;
        let store = tenant.store();
        let clock = self.services.clock.as_ref();

        let mut job = store.job(job_id).await?;
        if job.engine != EngineKind::Pipeline {
            return Err(DocflowError::Internal(format!(
                "job {job_id} belongs to the workflow engine"
            )));
        }
        match job.state {
            JobState::Queued => job.transition(JobState::Running, clock.now())?,
            JobState::Running => debug!(job_id = %job_id, "Resuming running job"),
            state => {
                debug!(job_id = %job_id, state = %state, "Job not runnable");
                return Ok(StepOutcome::Ignored);
            }
        }
        store.update_job(&job).await?;

        let mut document = store.document(job.document_id).await?;
        if document.state == DocumentState::Queued {
            document.start_processing(clock.now())?;
            store.update_document(&document).await?;
        }

        let index = job.cursor;
        let Some(stage) = job.pipeline.stages.get(index).cloned() else {
            return self.complete(job, document).await;
        };

        let executions = store.executions_for_job(job.id).await?;
        let prior = executor::prior_outputs(&executions);
        let attempt = executor::next_attempt(&executions, &stage.id);

        if !executor::guard_allows(&stage, &prior)? {
            executor::record_skip(store.as_ref(), job.id, &stage, attempt, clock).await?;
            self.services
                .emit(EventType::StageSkipped, &job, serde_json::json!({ "stage_id": stage.id }))
                .await;
            return self.advance(job, document, index, &serde_json::Value::Null).await;
        }

        if let Err(err) = self
            .services
            .registry
            .assert_dependencies_satisfied(&stage.id, &job)
            .await
        {
            return self.reject(job, document, &stage, attempt, &err).await;
        }
        let capability = match self.services.registry.resolve(&stage.capability) {
            Ok(capability) => capability,
            Err(err) => return self.reject(job, document, &stage, attempt, &err).await,
        };

        let ctx = StageContext::new(
            Arc::new(document.clone()),
            stage.clone(),
            job.id,
            attempt,
            prior,
            tenant.clone(),
        );
        let timeout = stage.timeout().or_else(|| self.config.stage_timeout());
        let StageRun { mut execution, outcome } =
            executor::invoke(store.as_ref(), &capability, &ctx, timeout, clock).await?;

        let outcome = if outcome.status == OutcomeStatus::AwaitingSignal {
            warn!(job_id = %job.id, stage_id = %stage.id, "Stage requested a signal wait; not supported by the pipeline engine");
            StageOutcome::fail_permanent("signal waits require the workflow engine")
        } else {
            outcome
        };

        if outcome.is_success() {
            executor::record_success(store.as_ref(), &mut execution, &outcome, clock).await?;
        } else {
            executor::record_failure(store.as_ref(), &mut execution, &outcome, clock).await?;
        }

        if store.job(job.id).await?.state == JobState::Cancelled {
            info!(job_id = %job.id, stage_id = %stage.id, "Cancellation observed; not advancing");
            return Ok(StepOutcome::Cancelled);
        }

        if outcome.is_success() {
            self.services
                .emit(
                    EventType::StageCompleted,
                    &job,
                    serde_json::json!({
                        "stage_id": stage.id,
                        "attempt": attempt,
                        "duration_ms": execution.duration_ms,
                    }),
                )
                .await;
            let output = serde_json::Value::Object(outcome.output);
            self.advance(job, document, index, &output).await
        } else {
            self.services
                .emit(
                    EventType::StageFailed,
                    &job,
                    serde_json::json!({
                        "stage_id": stage.id,
                        "attempt": attempt,
                        "error": execution.error,
                    }),
                )
                .await;
            let failure = StageExecutionFailure::new(
                &stage.id,
                attempt,
                outcome.error.unwrap_or_default(),
                outcome.retryable,
            );
            self.handle_failure(job, document, failure).await
        }
    }

    /// Picks the next stage. Parallel groups run one member per dispatch.
    fn next_index(job: &Job, index: usize, output: &serde_json::Value) -> Result<Option<usize>, DocflowError> {
        if job.pipeline.step_at(index).end > index + 1 {
            return Ok(Some(index + 1));
        }
        Ok(job.pipeline.next_after(index, output)?)
    }

    async fn advance(
        &self,
        mut job: Job,
        document: Document,
        index: usize,
        output: &serde_json::Value,
    ) -> Result<StepOutcome, DocflowError> {
        let Some(next) = Self::next_index(&job, index, output)? else {
            return self.complete(job, document).await;
        };
        let store = TenantContext::scoped_store()?;
        let next_stage = job.pipeline.stages[next].id.clone();
        job.advance_to(next);
        store.update_job(&job).await?;
        self.services
            .queue
            .enqueue(
                DispatchMessage::PipelineStep {
                    tenant_id: job.tenant_id.clone(),
                    job_id: job.id,
                },
                Duration::ZERO,
            )
            .await?;
        debug!(job_id = %job.id, next_stage = %next_stage, "Job advanced");
        Ok(StepOutcome::Advanced { next_stage })
    }

    async fn complete(&self, mut job: Job, mut document: Document) -> Result<StepOutcome, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();
        job.transition(JobState::Completed, now)?;
        store.update_job(&job).await?;
        document.complete(now)?;
        store.update_document(&document).await?;

        info!(job_id = %job.id, document_id = %document.id, "Document completed");
        self.services
            .emit(
                EventType::DocumentCompleted,
                &job,
                serde_json::json!({ "stages": job.pipeline.len() }),
            )
            .await;
        Ok(StepOutcome::Completed)
    }

    /// The stage could not be invoked at all: terminal for the job.
    async fn reject(
        &self,
        mut job: Job,
        document: Document,
        stage: &StageConfig,
        attempt: u32,
        err: &DocflowError,
    ) -> Result<StepOutcome, DocflowError> {
        let store = TenantContext::scoped_store()?;
        warn!(job_id = %job.id, stage_id = %stage.id, error = %err, code = err.code(), "Stage rejected");
        let row = executor::record_rejection(
            store.as_ref(),
            job.id,
            stage,
            attempt,
            err,
            self.services.clock.as_ref(),
        )
        .await?;
        self.services
            .emit(
                EventType::StageFailed,
                &job,
                serde_json::json!({ "stage_id": stage.id, "attempt": attempt, "error": row.error }),
            )
            .await;

        job.final_failure = true;
        job.record_error(&stage.id, err.code(), err.to_string(), self.services.clock.now());
        self.fail(job, document, &stage.id, err.to_string()).await
    }

    async fn handle_failure(
        &self,
        mut job: Job,
        mut document: Document,
        failure: StageExecutionFailure,
    ) -> Result<StepOutcome, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();
        let stage_id = failure.stage_id.clone();
        let retryable = failure.retryable;
        let err = DocflowError::from(failure);

        job.attempts += 1;
        job.record_error(&stage_id, err.code(), err.to_string(), now);
        if !retryable {
            job.final_failure = true;
        }

        if job.can_retry() {
            job.transition(JobState::Failed, now)?;
            job.transition(JobState::Queued, now)?;
            store.update_job(&job).await?;
            document.retry_count += 1;
            store.update_document(&document).await?;

            let delay = self.config.backoff.delay_for(job.attempts);
            self.services
                .queue
                .enqueue(
                    DispatchMessage::PipelineStep {
                        tenant_id: job.tenant_id.clone(),
                        job_id: job.id,
                    },
                    delay,
                )
                .await?;

            warn!(
                job_id = %job.id,
                stage_id = %stage_id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                delay_secs = delay.as_secs(),
                "Stage failed; retry scheduled"
            );
            self.services
                .emit(
                    EventType::JobRetryScheduled,
                    &job,
                    serde_json::json!({
                        "stage_id": stage_id,
                        "attempt": job.attempts,
                        "delay_secs": delay.as_secs(),
                    }),
                )
                .await;
            return Ok(StepOutcome::RetryScheduled {
                attempt: job.attempts,
                delay,
            });
        }

        self.fail(job, document, &stage_id, err.to_string()).await
    }

    async fn fail(
        &self,
        mut job: Job,
        mut document: Document,
        stage_id: &str,
        message: String,
    ) -> Result<StepOutcome, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();
        job.transition(JobState::Failed, now)?;
        store.update_job(&job).await?;
        document.fail(now, message.clone())?;
        store.update_document(&document).await?;

        warn!(job_id = %job.id, document_id = %document.id, stage_id = %stage_id, "Document failed");
        self.services
            .emit(
                EventType::DocumentFailed,
                &job,
                serde_json::json!({ "stage_id": stage_id, "error": message }),
            )
            .await;
        Ok(StepOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutcome;
    use crate::pipeline::{PipelineDefinition, StageConfig};
    use crate::state::StageExecutionState;
    use crate::testing::{CancellingCapability, ScriptedCapability, StaticCapability, TestHarness};
    use pretty_assertions::assert_eq;

    async fn setup(harness: &TestHarness, pipeline: PipelineDefinition) -> (TenantId, Uuid) {
        let tenant = harness.tenant("acme").await;
        let campaign = harness.campaign(&tenant, pipeline).await;
        let (_, job_id) = harness.submit(&tenant, campaign, "hash-1").await;
        (tenant, job_id)
    }

    #[tokio::test]
    async fn test_single_dispatch_runs_one_stage() {
        let harness = TestHarness::new();
        harness.register(StaticCapability::new("extractor"));
        let pipeline = PipelineDefinition::new(vec![
            StageConfig::new("extract", "extractor"),
            StageConfig::new("classify", "extractor"),
        ]);
        let (tenant, job_id) = setup(&harness, pipeline).await;

        let outcome = harness.orchestrator().dispatch(&tenant, job_id).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                next_stage: "classify".to_string()
            }
        );

        let job = harness.job(&tenant, job_id).await;
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.cursor, 1);
        assert_eq!(harness.executions(&tenant, job_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_held_lease_turns_dispatch_away() {
        let harness = TestHarness::new();
        harness.register(StaticCapability::new("extractor"));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")])).await;

        let _lease = harness
            .services
            .guard
            .try_acquire(format!("job:{job_id}"))
            .await
            .unwrap()
            .unwrap();
        let outcome = harness.orchestrator().dispatch(&tenant, job_id).await.unwrap();

        assert_eq!(outcome, StepOutcome::Busy);
        assert!(harness.executions(&tenant, job_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_finished_job_is_ignored() {
        let harness = TestHarness::new();
        harness.register(StaticCapability::new("extractor"));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")])).await;

        let orchestrator = harness.orchestrator();
        assert_eq!(orchestrator.dispatch(&tenant, job_id).await.unwrap(), StepOutcome::Completed);
        assert_eq!(orchestrator.dispatch(&tenant, job_id).await.unwrap(), StepOutcome::Ignored);
        assert_eq!(harness.executions(&tenant, job_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_signal_request_fails_permanently() {
        let harness = TestHarness::new();
        harness.register(ScriptedCapability::new(
            "kyc",
            vec![StageOutcome::await_signal("kyc-1")],
        ));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("verify", "kyc")])).await;

        let outcome = harness.orchestrator().dispatch(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Failed);

        let job = harness.job(&tenant, job_id).await;
        assert!(job.final_failure);
        assert_eq!(job.attempts, 1);
        assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Failed);
    }

    #[tokio::test]
    async fn test_false_guard_skips_stage() {
        let harness = TestHarness::new();
        harness.register(
            StaticCapability::new("extractor").with_output("doc_type", serde_json::json!("receipt")),
        );
        let signer = ScriptedCapability::new("signer", vec![StageOutcome::success_empty()]);
        let signer_calls = signer.call_counter();
        harness.register(signer);

        let pipeline = PipelineDefinition::new(vec![
            StageConfig::new("classify", "extractor"),
            StageConfig::new("sign", "signer").with_guard("classify.doc_type == \"contract\""),
        ]);
        let (tenant, job_id) = setup(&harness, pipeline).await;

        harness.drain().await;

        let rows = harness.executions(&tenant, job_id).await;
        let states: Vec<_> = rows.iter().map(|r| (r.stage_id.as_str(), r.state)).collect();
        assert_eq!(
            states,
            vec![
                ("classify", StageExecutionState::Completed),
                ("sign", StageExecutionState::Skipped),
            ]
        );
        assert_eq!(signer_calls.get(), 0);
        assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_capability_fails_job() {
        let harness = TestHarness::new();
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("extract", "ghost")])).await;

        let outcome = harness.orchestrator().dispatch(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Failed);

        let job = harness.job(&tenant, job_id).await;
        assert_eq!(job.errors[0].code, "CAPABILITY_NOT_FOUND");
        assert_eq!(harness.queue.history().len(), 1, "no retry was scheduled");
    }

    #[tokio::test]
    async fn test_stage_timeout_is_retryable_failure() {
        let mut harness = TestHarness::new();
        harness.config.orchestrator.stage_timeout_secs = Some(1);
        harness.register(
            ScriptedCapability::new("slow", vec![StageOutcome::success_empty()])
                .with_latency(Duration::from_secs(5)),
        );
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("extract", "slow")])).await;

        tokio::time::pause();
        let outcome = harness.orchestrator().dispatch(&tenant, job_id).await.unwrap();

        assert_eq!(
            outcome,
            StepOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(60)
            }
        );
        let rows = harness.executions(&tenant, job_id).await;
        assert!(rows[0].error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_during_successful_stage_stops_job() {
        let harness = TestHarness::new();
        harness.register(CancellingCapability::new(
            "extractor",
            harness.intake(),
            StageOutcome::success_empty(),
        ));
        harness.register(StaticCapability::new("classifier"));
        let pipeline = PipelineDefinition::new(vec![
            StageConfig::new("extract", "extractor"),
            StageConfig::new("classify", "classifier"),
        ]);
        let (tenant, job_id) = setup(&harness, pipeline).await;

        let outcome = harness.orchestrator().dispatch(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);

        let job = harness.job(&tenant, job_id).await;
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.cursor, 0);
        assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Cancelled);
        assert_eq!(harness.queue.history().len(), 1, "no follow-up dispatch");

        let rows = harness.executions(&tenant, job_id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, StageExecutionState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_during_failing_stage_skips_retry() {
        let harness = TestHarness::new();
        harness.register(CancellingCapability::new(
            "extractor",
            harness.intake(),
            StageOutcome::fail("transient"),
        ));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")])).await;

        let outcome = harness.orchestrator().dispatch(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);

        let job = harness.job(&tenant, job_id).await;
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.attempts, 0);
        assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Cancelled);
        assert_eq!(harness.queue.history().len(), 1, "no retry scheduled");
    }
}
