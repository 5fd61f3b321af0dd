//! The durable, checkpointed workflow engine.
//!
//! One [`DispatchMessage::WorkflowRun`] drives a workflow as far as it can
//! go: it replays the recorded stage executions to find its position, runs
//! the next step (a single stage or a whole parallel group), checkpoints and
//! repeats. It stops when the pipeline finishes, when a stage fails beyond
//! its retry policy, or when every remaining member of the current step is
//! waiting on an external signal. A signal (or the expiry sweep) later
//! re-enqueues the workflow, and any worker may pick it up.

use super::replay::{self, NextStep};
use super::signal::apply_signal;
use super::{ReceivedSignal, SignalDisposition, SignalWait, WorkflowCheckpoint, WorkflowStatus};
use crate::config::WorkflowConfig;
use crate::context::StageContext;
use crate::core::{EventType, OutcomeStatus, StageOutcome};
use crate::errors::{DocflowError, StageExecutionFailure, StorageError};
use crate::observability::JobSpanAttributes;
use crate::pipeline::executor::{self, StageRun};
use crate::pipeline::{BackoffSchedule, DispatchMessage, EngineKind, EngineServices, StageConfig};
use crate::state::{Document, DocumentState, Job, JobState, StageExecution};
use crate::storage::TenantStore;
use crate::tenant::{TenantContext, TenantId};
use crate::utils::to_chrono;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What one workflow run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Another dispatch holds the workflow; nothing ran.
    Busy,
    /// The workflow was not runnable.
    Ignored,
    /// Every stage finished; job and document are completed.
    Completed,
    /// The workflow is parked on external signals.
    Suspended {
        /// Correlation ids awaited.
        awaiting: Vec<String>,
    },
    /// A stage exhausted its retry policy and the job was re-queued.
    RetryScheduled {
        /// Failed job-level attempts at this step.
        attempt: u32,
        /// Delay before the workflow runs again.
        delay: Duration,
    },
    /// The workflow failed terminally.
    Failed,
    /// Cancellation was observed; nothing else will run.
    Cancelled,
}

/// How one member of a step ended.
#[derive(Debug)]
enum StageResult {
    Completed,
    Skipped,
    Awaiting,
    Failed(StageExecutionFailure),
    Rejected { stage_id: String, error: DocflowError },
}

/// The durable engine.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    services: EngineServices,
    config: WorkflowConfig,
    job_backoff: BackoffSchedule,
}

impl WorkflowEngine {
    /// Creates an engine. `job_backoff` spaces job-level retries once a
    /// stage has exhausted its own policy.
    #[must_use]
    pub fn new(services: EngineServices, config: WorkflowConfig, job_backoff: BackoffSchedule) -> Self {
        Self {
            services,
            config,
            job_backoff,
        }
    }

    /// Runs or resumes a workflow under its tenant's binding.
    ///
    /// # Errors
    ///
    /// Storage, routing and tenant-binding failures. Stage failures are
    /// reported through [`WorkflowOutcome`].
    pub async fn run(&self, tenant_id: &TenantId, workflow_id: Uuid) -> Result<WorkflowOutcome, DocflowError> {
        let message = DispatchMessage::WorkflowRun {
            tenant_id: tenant_id.clone(),
            workflow_id,
        };
        let span = JobSpanAttributes::new(EngineKind::Workflow, tenant_id, workflow_id).span();
        let drive = self.services.tenants.run(tenant_id, self.drive(workflow_id)).instrument(span);
        match self.services.guard.run_exclusive(message.dispatch_key(), drive).await? {
            Some(outcome) => outcome,
            None => {
                debug!(tenant_id = %tenant_id, workflow_id = %workflow_id, "Workflow already in flight");
                Ok(WorkflowOutcome::Busy)
            }
        }
    }

    /// Delivers an external signal.
    ///
    /// Safe to call before anyone waits (the signal is buffered) and more
    /// than once per correlation id (later calls are no-ops).
    ///
    /// # Errors
    ///
    /// Control-store failures, or failures while resuming the waiting
    /// workflow (the wait is restored in that case).
    pub async fn signal(
        &self,
        correlation_id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<SignalDisposition, DocflowError> {
        let span = info_span!("signal", correlation_id = %correlation_id);
        self.deliver(correlation_id, payload).instrument(span).await
    }

    async fn deliver(
        &self,
        correlation_id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<SignalDisposition, DocflowError> {
        let control = &self.services.control;
        let received = ReceivedSignal::new(correlation_id, payload.clone(), self.services.clock.now());
        if !control.record_signal(received).await? {
            info!(correlation_id = %correlation_id, "Duplicate signal ignored");
            return Ok(SignalDisposition::Duplicate);
        }

        let Some(wait) = control.take_wait(correlation_id).await? else {
            info!(correlation_id = %correlation_id, "Signal buffered; no workflow is waiting");
            return Ok(SignalDisposition::Buffered);
        };

        let tenant_id = wait.tenant_id.clone();
        let workflow_id = wait.workflow_id;
        match self.services.tenants.run(&tenant_id, self.resume(&wait, &payload)).await {
            Ok(()) => Ok(SignalDisposition::Resumed { workflow_id }),
            Err(err) => {
                warn!(correlation_id = %correlation_id, error = %err, "Resume failed; restoring wait");
                control.register_wait(wait).await?;
                Err(err)
            }
        }
    }

    /// Fails every workflow whose signal deadline has passed.
    ///
    /// Returns the number of workflows failed with a callback timeout.
    ///
    /// # Errors
    ///
    /// Control-store and tenant-binding failures.
    pub async fn expire_waits(&self) -> Result<usize, DocflowError> {
        let control = &self.services.control;
        let expired = control.expired_waits(self.services.clock.now()).await?;
        let mut failed = 0;

        for candidate in expired {
            let Some(wait) = control.take_wait(&candidate.correlation_id).await? else {
                continue;
            };
            let key = DispatchMessage::WorkflowRun {
                tenant_id: wait.tenant_id.clone(),
                workflow_id: wait.workflow_id,
            }
            .dispatch_key();
            let tenant_id = wait.tenant_id.clone();
            let span = info_span!(
                "timeout",
                tenant_id = %tenant_id,
                job_id = %wait.workflow_id,
                correlation_id = %wait.correlation_id
            );
            let timeout = self
                .services
                .tenants
                .run(&tenant_id, self.time_out(&wait))
                .instrument(span);
            let outcome = self.services.guard.run_exclusive(key, timeout).await?;
            let Some(result) = outcome else {
                debug!(correlation_id = %wait.correlation_id, "Workflow busy; expiry deferred");
                control.register_wait(wait).await?;
                continue;
            };
            match result {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(err) => {
                    control.register_wait(wait).await?;
                    return Err(err);
                }
            }
        }
        Ok(failed)
    }

    /// Loads a workflow's checkpoint.
    pub async fn checkpoint(
        &self,
        tenant_id: &TenantId,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowCheckpoint>, DocflowError> {
        self.services
            .tenants
            .run(tenant_id, async move { Ok(TenantContext::scoped_store()?.checkpoint(workflow_id).await?) })
            .await
    }

    async fn drive(&self, workflow_id: Uuid) -> Result<WorkflowOutcome, DocflowError> {
        let tenant = TenantContext::require()?;
        let store = tenant.store();
        let clock = self.services.clock.as_ref();

        let mut job = store.job(workflow_id).await?;
        if job.engine != EngineKind::Workflow {
            return Err(DocflowError::Internal(format!(
                "job {workflow_id} belongs to the pipeline engine"
            )));
        }
        match job.state {
            JobState::Queued => job.transition(JobState::Running, clock.now())?,
            JobState::Running => debug!(job_id = %job.id, "Resuming running workflow"),
            state => {
                debug!(job_id = %job.id, state = %state, "Workflow not runnable");
                return Ok(WorkflowOutcome::Ignored);
            }
        }
        store.update_job(&job).await?;

        let mut document = store.document(job.document_id).await?;
        if document.state == DocumentState::Queued {
            document.start_processing(clock.now())?;
            store.update_document(&document).await?;
        }

        let mut checkpoint = store
            .checkpoint(job.id)
            .await?
            .unwrap_or_else(|| WorkflowCheckpoint::new(job.id, job.tenant_id.clone(), clock.now()));

        loop {
            if store.job(job.id).await?.state == JobState::Cancelled {
                return self.observe_cancellation(store.as_ref(), &job).await;
            }

            let executions = store.executions_for_job(job.id).await?;
            let replayed = replay::replay(&job.pipeline, &executions)?;
            checkpoint.completed_stages = replayed.completed;

            let (range, pending, interrupted) = match replayed.next {
                NextStep::Done => return self.complete(job, document, checkpoint).await,
                NextStep::Waiting { position, awaiting } => {
                    if self.settle_orphaned_waits(store.as_ref(), &executions, &awaiting).await? {
                        continue;
                    }
                    checkpoint.position = position;
                    checkpoint.awaiting = awaiting.clone();
                    checkpoint.status = WorkflowStatus::Suspended;
                    self.save(store.as_ref(), &mut checkpoint).await?;
                    info!(job_id = %job.id, awaiting = ?awaiting, "Workflow suspended");
                    return Ok(WorkflowOutcome::Suspended { awaiting });
                }
                NextStep::Run {
                    range,
                    pending,
                    interrupted,
                } => (range, pending, interrupted),
            };

            for id in interrupted {
                let mut row = store.execution(id).await?;
                warn!(job_id = %job.id, stage_id = %row.stage_id, execution_id = %id, "Settling interrupted stage");
                row.fail("interrupted before completion", clock.now())?;
                store.update_execution(&row).await?;
            }

            if job.cursor != range.start {
                job.advance_to(range.start);
                store.update_job(&job).await?;
            }
            checkpoint.position = range.start;
            checkpoint.awaiting.clear();
            checkpoint.status = WorkflowStatus::Running;
            self.save(store.as_ref(), &mut checkpoint).await?;

            let prior = executor::prior_outputs(&executions);
            let shared = Arc::new(document.clone());
            let results = join_all(pending.iter().map(|&member| {
                self.run_stage(&tenant, &job, &shared, &job.pipeline.stages[member], &executions, &prior)
            }))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

            if store.job(job.id).await?.state == JobState::Cancelled {
                return self.observe_cancellation(store.as_ref(), &job).await;
            }

            let mut rejected = None;
            let mut failed = None;
            for result in results {
                match result {
                    StageResult::Rejected { stage_id, error } if rejected.is_none() => {
                        rejected = Some((stage_id, error));
                    }
                    StageResult::Failed(failure) if failed.is_none() => failed = Some(failure),
                    _ => {}
                }
            }

            if let Some((stage_id, error)) = rejected {
                job.final_failure = true;
                job.record_error(&stage_id, error.code(), error.to_string(), clock.now());
                return self.fail(job, document, checkpoint, &stage_id, error.to_string()).await;
            }
            if let Some(failure) = failed {
                return self.handle_failure(job, document, checkpoint, failure).await;
            }
        }
    }

    /// Fails awaiting rows whose wait is gone, so the stage runs again and
    /// registers a fresh one. Returns true if any row was settled.
    async fn settle_orphaned_waits(
        &self,
        store: &dyn TenantStore,
        executions: &[StageExecution],
        awaiting: &[String],
    ) -> Result<bool, DocflowError> {
        let control = &self.services.control;
        let mut settled = false;
        for correlation_id in awaiting {
            if control.wait(correlation_id).await?.is_some() {
                continue;
            }
            let orphaned = executions.iter().filter(|row| {
                row.is_awaiting_signal() && row.correlation_id.as_deref() == Some(correlation_id.as_str())
            });
            for row in orphaned {
                let mut row = row.clone();
                warn!(
                    job_id = %row.job_id,
                    stage_id = %row.stage_id,
                    correlation_id = %correlation_id,
                    "Awaiting stage has no registered wait; re-running"
                );
                row.fail("signal wait lost before registration", self.services.clock.now())?;
                store.update_execution(&row).await?;
                settled = true;
            }
        }
        Ok(settled)
    }

    /// Stops a workflow whose job was cancelled, dropping any wait a stage
    /// registered after the cancellation was recorded.
    async fn observe_cancellation(&self, store: &dyn TenantStore, job: &Job) -> Result<WorkflowOutcome, DocflowError> {
        let now = self.services.clock.now();
        for wait in self.services.control.remove_waits_for_workflow(job.id).await? {
            let mut row = store.execution(wait.execution_id).await?;
            if !row.is_terminal() {
                row.fail("cancelled", now)?;
                store.update_execution(&row).await?;
            }
        }
        info!(job_id = %job.id, "Cancellation observed; workflow stops");
        Ok(WorkflowOutcome::Cancelled)
    }

    async fn run_stage(
        &self,
        tenant: &TenantContext,
        job: &Job,
        document: &Arc<Document>,
        stage: &StageConfig,
        executions: &[StageExecution],
        prior: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<StageResult, DocflowError> {
        let store = tenant.store();
        let clock = self.services.clock.as_ref();
        let mut attempt = executor::next_attempt(executions, &stage.id);

        if !executor::guard_allows(stage, prior)? {
            executor::record_skip(store.as_ref(), job.id, stage, attempt, clock).await?;
            self.services
                .emit(EventType::StageSkipped, job, serde_json::json!({ "stage_id": stage.id }))
                .await;
            return Ok(StageResult::Skipped);
        }

        let policy = stage.retry.clone().unwrap_or_else(|| self.config.stage_retry.clone());
        let timeout = stage.timeout().or_else(|| self.config.stage_timeout());
        let mut tries = 0;

        loop {
            tries += 1;
            if let Err(err) = self.services.registry.assert_dependencies_satisfied(&stage.id, job).await {
                return self.reject(store.as_ref(), job, stage, attempt, err).await;
            }
            let capability = match self.services.registry.resolve(&stage.capability) {
                Ok(capability) => capability,
                Err(err) => return self.reject(store.as_ref(), job, stage, attempt, err).await,
            };

            let ctx = StageContext::new(
                Arc::clone(document),
                stage.clone(),
                job.id,
                attempt,
                prior.clone(),
                tenant.clone(),
            );
            let StageRun { mut execution, outcome } =
                executor::invoke(store.as_ref(), &capability, &ctx, timeout, clock).await?;

            match outcome.status {
                OutcomeStatus::Succeeded => {
                    executor::record_success(store.as_ref(), &mut execution, &outcome, clock).await?;
                    self.services
                        .emit(
                            EventType::StageCompleted,
                            job,
                            serde_json::json!({
                                "stage_id": stage.id,
                                "attempt": attempt,
                                "duration_ms": execution.duration_ms,
                            }),
                        )
                        .await;
                    return Ok(StageResult::Completed);
                }
                OutcomeStatus::AwaitingSignal if !capability.descriptor().supports_suspension => {
                    let failure = StageOutcome::fail_permanent(format!(
                        "capability '{}' asked to wait but does not support suspension",
                        stage.capability
                    ));
                    return self.refuse_wait(store.as_ref(), job, stage, &mut execution, failure).await;
                }
                OutcomeStatus::AwaitingSignal => {
                    return self.suspend(store.as_ref(), job, stage, execution, outcome).await;
                }
                OutcomeStatus::Failed => {
                    executor::record_failure(store.as_ref(), &mut execution, &outcome, clock).await?;
                    self.services
                        .emit(
                            EventType::StageFailed,
                            job,
                            serde_json::json!({
                                "stage_id": stage.id,
                                "attempt": attempt,
                                "error": execution.error,
                            }),
                        )
                        .await;

                    let cancelled = store.job(job.id).await?.state == JobState::Cancelled;
                    if outcome.retryable && !cancelled && policy.allows_retry_after(tries) {
                        let delay = policy.delay_after(tries);
                        debug!(
                            job_id = %job.id,
                            stage_id = %stage.id,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying stage in place"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(StageResult::Failed(StageExecutionFailure::new(
                        &stage.id,
                        attempt,
                        outcome.error.unwrap_or_default(),
                        outcome.retryable,
                    )));
                }
            }
        }
    }

    async fn reject(
        &self,
        store: &dyn TenantStore,
        job: &Job,
        stage: &StageConfig,
        attempt: u32,
        error: DocflowError,
    ) -> Result<StageResult, DocflowError> {
        warn!(job_id = %job.id, stage_id = %stage.id, error = %error, code = error.code(), "Stage rejected");
        let row =
            executor::record_rejection(store, job.id, stage, attempt, &error, self.services.clock.as_ref()).await?;
        self.services
            .emit(
                EventType::StageFailed,
                job,
                serde_json::json!({ "stage_id": stage.id, "attempt": attempt, "error": row.error }),
            )
            .await;
        Ok(StageResult::Rejected {
            stage_id: stage.id.clone(),
            error,
        })
    }

    /// Parks a stage on its correlation id, or completes it at once when the
    /// signal was already buffered.
    async fn suspend(
        &self,
        store: &dyn TenantStore,
        job: &Job,
        stage: &StageConfig,
        mut execution: StageExecution,
        outcome: StageOutcome,
    ) -> Result<StageResult, DocflowError> {
        let clock = self.services.clock.as_ref();
        let control = &self.services.control;

        let Some(correlation_id) = outcome.correlation_id.clone() else {
            let failure = StageOutcome::fail_permanent("signal wait requested without a correlation id");
            return self.refuse_wait(store, job, stage, &mut execution, failure).await;
        };

        let now = clock.now();
        execution.correlation_id = Some(correlation_id.clone());
        execution.output = outcome.output.clone();
        execution.artifacts = outcome.artifacts.clone();
        execution.usage = outcome.usage.clone();

        let window = outcome
            .signal_timeout
            .or_else(|| stage.callback_timeout())
            .unwrap_or_else(|| self.config.callback_timeout());
        let deadline = now + to_chrono(window);
        let wait = SignalWait {
            correlation_id: correlation_id.clone(),
            tenant_id: job.tenant_id.clone(),
            workflow_id: job.id,
            stage_id: stage.id.clone(),
            execution_id: execution.id,
            registered_at: now,
            deadline,
        };
        // The wait goes in before the row is marked awaiting, so an awaiting
        // row always has a deadline somewhere.
        match control.register_wait(wait.clone()).await {
            Ok(()) => {}
            Err(StorageError::Conflict { .. }) => {
                let stale = control
                    .wait(&correlation_id)
                    .await?
                    .filter(|w| w.workflow_id == job.id && w.stage_id == stage.id);
                if stale.is_none() {
                    let failure =
                        StageOutcome::fail_permanent(format!("correlation id '{correlation_id}' is already awaited"));
                    return self.refuse_wait(store, job, stage, &mut execution, failure).await;
                }
                debug!(job_id = %job.id, correlation_id = %correlation_id, "Replacing wait left by an earlier attempt");
                control.take_wait(&correlation_id).await?;
                control.register_wait(wait).await?;
            }
            Err(err) => return Err(err.into()),
        }
        if let Err(err) = store.update_execution(&execution).await {
            control.take_wait(&correlation_id).await?;
            return Err(err.into());
        }

        if let Some(signal) = control.signal(&correlation_id).await? {
            if signal.is_pending() && control.take_wait(&correlation_id).await?.is_some() {
                debug!(job_id = %job.id, correlation_id = %correlation_id, "Consuming buffered signal");
                self.consume(store, job, &mut execution, &correlation_id, &signal.payload)
                    .await?;
                return Ok(StageResult::Completed);
            }
        }

        info!(
            job_id = %job.id,
            stage_id = %stage.id,
            correlation_id = %correlation_id,
            deadline = %deadline,
            "Stage awaiting signal"
        );
        self.services
            .emit(
                EventType::WorkflowSuspended,
                job,
                serde_json::json!({
                    "stage_id": stage.id,
                    "correlation_id": correlation_id,
                    "deadline": deadline.to_rfc3339(),
                }),
            )
            .await;
        Ok(StageResult::Awaiting)
    }

    async fn refuse_wait(
        &self,
        store: &dyn TenantStore,
        job: &Job,
        stage: &StageConfig,
        execution: &mut StageExecution,
        failure: StageOutcome,
    ) -> Result<StageResult, DocflowError> {
        warn!(job_id = %job.id, stage_id = %stage.id, error = ?failure.error, "Signal wait refused");
        executor::record_failure(store, execution, &failure, self.services.clock.as_ref()).await?;
        self.services
            .emit(
                EventType::StageFailed,
                job,
                serde_json::json!({ "stage_id": stage.id, "attempt": execution.attempt, "error": execution.error }),
            )
            .await;
        Ok(StageResult::Failed(StageExecutionFailure::new(
            &stage.id,
            execution.attempt,
            failure.error.unwrap_or_default(),
            false,
        )))
    }

    /// Completes a waiting row with a signal payload.
    async fn consume(
        &self,
        store: &dyn TenantStore,
        job: &Job,
        execution: &mut StageExecution,
        correlation_id: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DocflowError> {
        apply_signal(execution, payload, self.services.clock.now())?;
        store.update_execution(execution).await?;
        self.services
            .control
            .mark_signal_consumed(correlation_id, job.id)
            .await?;

        info!(job_id = %job.id, stage_id = %execution.stage_id, correlation_id = %correlation_id, "Workflow resumed by signal");
        self.services
            .emit(
                EventType::WorkflowResumed,
                job,
                serde_json::json!({ "stage_id": execution.stage_id, "correlation_id": correlation_id }),
            )
            .await;
        Ok(())
    }

    async fn resume(
        &self,
        wait: &SignalWait,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DocflowError> {
        let store = TenantContext::scoped_store()?;
        let job = store.job(wait.workflow_id).await?;
        let mut row = store.execution(wait.execution_id).await?;
        if job.is_finished() || row.is_terminal() {
            warn!(job_id = %job.id, correlation_id = %wait.correlation_id, "Stale wait; signal not applied");
            return Ok(());
        }

        self.consume(store.as_ref(), &job, &mut row, &wait.correlation_id, payload)
            .await?;
        self.services
            .queue
            .enqueue(
                DispatchMessage::WorkflowRun {
                    tenant_id: job.tenant_id.clone(),
                    workflow_id: job.id,
                },
                Duration::ZERO,
            )
            .await?;
        Ok(())
    }

    /// Fails the workflow behind an expired wait. Returns false if there was
    /// nothing left to fail.
    async fn time_out(&self, wait: &SignalWait) -> Result<bool, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();
        let mut job = store.job(wait.workflow_id).await?;
        let mut row = store.execution(wait.execution_id).await?;

        if job.is_finished() || row.is_terminal() {
            if !row.is_terminal() {
                row.fail("workflow no longer running", now)?;
                store.update_execution(&row).await?;
            }
            return Ok(false);
        }

        row.time_out(now)?;
        store.update_execution(&row).await?;
        warn!(
            job_id = %job.id,
            stage_id = %wait.stage_id,
            correlation_id = %wait.correlation_id,
            "Signal wait timed out"
        );
        self.services
            .emit(
                EventType::StageFailed,
                &job,
                serde_json::json!({
                    "stage_id": wait.stage_id,
                    "attempt": row.attempt,
                    "error": row.error,
                    "timed_out": true,
                }),
            )
            .await;

        let err = DocflowError::CallbackTimeout {
            stage_id: wait.stage_id.clone(),
            correlation_id: wait.correlation_id.clone(),
        };
        job.final_failure = true;
        job.record_error(&wait.stage_id, err.code(), err.to_string(), now);

        let document = store.document(job.document_id).await?;
        let checkpoint = store
            .checkpoint(job.id)
            .await?
            .unwrap_or_else(|| WorkflowCheckpoint::new(job.id, job.tenant_id.clone(), now));
        self.fail(job, document, checkpoint, &wait.stage_id, err.to_string())
            .await?;
        Ok(true)
    }

    async fn handle_failure(
        &self,
        mut job: Job,
        mut document: Document,
        mut checkpoint: WorkflowCheckpoint,
        failure: StageExecutionFailure,
    ) -> Result<WorkflowOutcome, DocflowError> {
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

        if !job.can_retry() {
            return self.fail(job, document, checkpoint, &stage_id, err.to_string()).await;
        }

        job.transition(JobState::Failed, now)?;
        job.transition(JobState::Queued, now)?;
        store.update_job(&job).await?;
        document.retry_count += 1;
        store.update_document(&document).await?;
        self.save(store.as_ref(), &mut checkpoint).await?;

        let delay = self.job_backoff.delay_for(job.attempts);
        self.services
            .queue
            .enqueue(
                DispatchMessage::WorkflowRun {
                    tenant_id: job.tenant_id.clone(),
                    workflow_id: job.id,
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
            "Stage retries exhausted; workflow retry scheduled"
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
        Ok(WorkflowOutcome::RetryScheduled {
            attempt: job.attempts,
            delay,
        })
    }

    async fn complete(
        &self,
        mut job: Job,
        mut document: Document,
        mut checkpoint: WorkflowCheckpoint,
    ) -> Result<WorkflowOutcome, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();
        job.advance_to(job.pipeline.len());
        job.transition(JobState::Completed, now)?;
        store.update_job(&job).await?;
        document.complete(now)?;
        store.update_document(&document).await?;

        checkpoint.position = job.pipeline.len();
        checkpoint.awaiting.clear();
        checkpoint.status = WorkflowStatus::Completed;
        self.save(store.as_ref(), &mut checkpoint).await?;

        info!(job_id = %job.id, document_id = %document.id, "Workflow completed");
        self.services
            .emit(
                EventType::DocumentCompleted,
                &job,
                serde_json::json!({ "stages": checkpoint.completed_stages }),
            )
            .await;
        Ok(WorkflowOutcome::Completed)
    }

    async fn fail(
        &self,
        mut job: Job,
        mut document: Document,
        mut checkpoint: WorkflowCheckpoint,
        stage_id: &str,
        message: String,
    ) -> Result<WorkflowOutcome, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();
        if job.state == JobState::Queued {
            job.transition(JobState::Running, now)?;
        }
        job.transition(JobState::Failed, now)?;
        store.update_job(&job).await?;
        if document.state == DocumentState::Queued {
            document.start_processing(now)?;
        }
        document.fail(now, message.clone())?;
        store.update_document(&document).await?;

        checkpoint.status = WorkflowStatus::Failed;
        checkpoint.awaiting.clear();
        self.save(store.as_ref(), &mut checkpoint).await?;

        for wait in self.services.control.remove_waits_for_workflow(job.id).await? {
            let mut row = store.execution(wait.execution_id).await?;
            if !row.is_terminal() {
                row.fail("workflow failed", now)?;
                store.update_execution(&row).await?;
            }
        }

        warn!(job_id = %job.id, document_id = %document.id, stage_id = %stage_id, "Workflow failed");
        self.services
            .emit(
                EventType::DocumentFailed,
                &job,
                serde_json::json!({ "stage_id": stage_id, "error": message }),
            )
            .await;
        Ok(WorkflowOutcome::Failed)
    }

    async fn save(&self, store: &dyn TenantStore, checkpoint: &mut WorkflowCheckpoint) -> Result<(), DocflowError> {
        checkpoint.touch(self.services.clock.now());
        store.save_checkpoint(checkpoint.clone()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineDefinition, StageRetryPolicy};
    use crate::state::StageExecutionState;
    use crate::utils::{generate_id, Clock};
    use crate::testing::{
        AwaitingCapability, CancellingCapability, ScriptedCapability, StaticCapability, TestHarness,
    };
    use pretty_assertions::assert_eq;

    async fn setup(harness: &TestHarness, pipeline: PipelineDefinition) -> (TenantId, Uuid) {
        let tenant = harness.tenant("acme").await;
        let campaign = harness.workflow_campaign(&tenant, pipeline).await;
        let (_, job_id) = harness.submit(&tenant, campaign, "hash-1").await;
        (tenant, job_id)
    }

    #[tokio::test]
    async fn test_runs_whole_pipeline_in_one_dispatch() {
        let harness = TestHarness::new();
        harness.register(StaticCapability::new("extractor"));
        let pipeline = PipelineDefinition::new(vec![
            StageConfig::new("extract", "extractor"),
            StageConfig::new("classify", "extractor"),
        ]);
        let (tenant, job_id) = setup(&harness, pipeline).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed);

        let checkpoint = harness
            .workflow_engine()
            .checkpoint(&tenant, job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.status, WorkflowStatus::Completed);
        assert_eq!(checkpoint.completed_stages, vec!["extract", "classify"]);
        assert_eq!(checkpoint.position, 2);
    }

    #[tokio::test]
    async fn test_held_lease_turns_run_away() {
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
        assert_eq!(harness.workflow_engine().run(&tenant, job_id).await.unwrap(), WorkflowOutcome::Busy);
    }

    #[tokio::test]
    async fn test_stage_policy_retries_in_place() {
        let harness = TestHarness::new();
        let flaky = ScriptedCapability::new(
            "flaky",
            vec![StageOutcome::fail("busy"), StageOutcome::success_empty()],
        );
        let calls = flaky.call_counter();
        harness.register(flaky);
        let pipeline = PipelineDefinition::new(vec![StageConfig::new("ocr", "flaky").with_retry(
            StageRetryPolicy::none().with_max_attempts(2).with_base_delay_ms(0),
        )]);
        let (tenant, job_id) = setup(&harness, pipeline).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Completed);
        assert_eq!(calls.get(), 2);

        let rows = harness.executions(&tenant, job_id).await;
        let attempts: Vec<_> = rows.iter().map(|r| (r.attempt, r.state)).collect();
        assert_eq!(
            attempts,
            vec![(1, StageExecutionState::Failed), (2, StageExecutionState::Completed)]
        );
    }

    #[tokio::test]
    async fn test_exhausted_stage_policy_schedules_job_retry() {
        let harness = TestHarness::new();
        harness.register(ScriptedCapability::new(
            "flaky",
            vec![StageOutcome::fail("busy"), StageOutcome::success_empty()],
        ));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("ocr", "flaky")])).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(
            outcome,
            WorkflowOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Queued);

        harness.run_to_completion().await;
        assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_workflow() {
        let harness = TestHarness::new();
        harness.register(ScriptedCapability::new(
            "strict",
            vec![StageOutcome::fail_permanent("unreadable")],
        ));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("ocr", "strict")])).await;

        assert_eq!(harness.workflow_engine().run(&tenant, job_id).await.unwrap(), WorkflowOutcome::Failed);
        assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Failed);

        let checkpoint = harness
            .workflow_engine()
            .checkpoint(&tenant, job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_suspends_on_signal_request() {
        let harness = TestHarness::new();
        harness.register(AwaitingCapability::new("kyc", "kyc-1"));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("verify", "kyc")])).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(
            outcome,
            WorkflowOutcome::Suspended {
                awaiting: vec!["kyc-1".to_string()]
            }
        );

        let wait = harness.services.control.wait("kyc-1").await.unwrap().unwrap();
        assert_eq!(wait.workflow_id, job_id);
        assert_eq!(wait.deadline - wait.registered_at, chrono::Duration::hours(24));

        let rows = harness.executions(&tenant, job_id).await;
        assert!(rows[0].is_awaiting_signal());
        assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Running);
    }

    #[tokio::test]
    async fn test_duplicate_correlation_id_fails_stage() {
        let harness = TestHarness::new();
        harness.register(AwaitingCapability::new("kyc", "shared"));
        let tenant = harness.tenant("acme").await;
        let campaign = harness
            .workflow_campaign(
                &tenant,
                PipelineDefinition::new(vec![StageConfig::new("verify", "kyc")]),
            )
            .await;
        let (_, first) = harness.submit(&tenant, campaign, "hash-1").await;
        let (_, second) = harness.submit(&tenant, campaign, "hash-2").await;

        let engine = harness.workflow_engine();
        assert!(matches!(engine.run(&tenant, first).await.unwrap(), WorkflowOutcome::Suspended { .. }));
        assert_eq!(engine.run(&tenant, second).await.unwrap(), WorkflowOutcome::Failed);
    }

    #[tokio::test]
    async fn test_pipeline_job_is_rejected() {
        let harness = TestHarness::new();
        harness.register(StaticCapability::new("extractor"));
        let tenant = harness.tenant("acme").await;
        let campaign = harness
            .campaign(&tenant, PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")]))
            .await;
        let (_, job_id) = harness.submit(&tenant, campaign, "hash-1").await;

        let err = harness.workflow_engine().run(&tenant, job_id).await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
    }

    #[tokio::test]
    async fn test_cancel_during_failing_stage_is_not_overwritten() {
        let harness = TestHarness::new();
        harness.register(CancellingCapability::new(
            "ocr",
            harness.intake(),
            StageOutcome::fail("transient"),
        ));
        let (tenant, job_id) = setup(&harness, PipelineDefinition::new(vec![StageConfig::new("read", "ocr")])).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Cancelled);

        let job = harness.job(&tenant, job_id).await;
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.attempts, 0);
        assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Cancelled);
        assert_eq!(harness.queue.history().len(), 1, "no retry scheduled");

        let checkpoint = harness
            .workflow_engine()
            .checkpoint(&tenant, job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_in_place_retry_stops_retrying() {
        let harness = TestHarness::new();
        let cancelling = CancellingCapability::new("ocr", harness.intake(), StageOutcome::fail("transient"));
        let calls = cancelling.call_counter();
        harness.register(cancelling);
        let pipeline = PipelineDefinition::new(vec![StageConfig::new("read", "ocr").with_retry(
            StageRetryPolicy::none().with_max_attempts(3).with_base_delay_ms(0),
        )]);
        let (tenant, job_id) = setup(&harness, pipeline).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_successful_stage_stops_workflow() {
        let harness = TestHarness::new();
        harness.register(CancellingCapability::new(
            "extractor",
            harness.intake(),
            StageOutcome::success_empty(),
        ));
        let classifier = StaticCapability::new("classifier");
        let calls = classifier.call_counter();
        harness.register(classifier);
        let pipeline = PipelineDefinition::new(vec![
            StageConfig::new("extract", "extractor"),
            StageConfig::new("classify", "classifier"),
        ]);
        let (tenant, job_id) = setup(&harness, pipeline).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        assert_eq!(calls.get(), 0);
        assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Cancelled);
        assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_before_signal_wait_drops_the_wait() {
        let harness = TestHarness::new();
        harness.register(CancellingCapability::new(
            "kyc",
            harness.intake(),
            StageOutcome::await_signal("kyc-1"),
        ));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("verify", "kyc")])).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Cancelled);
        assert!(harness.services.control.wait("kyc-1").await.unwrap().is_none());

        let rows = harness.executions(&tenant, job_id).await;
        assert_eq!(rows[0].state, StageExecutionState::Failed);
        assert_eq!(rows[0].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_undeclared_suspension_fails_stage() {
        let harness = TestHarness::new();
        harness.register(ScriptedCapability::new(
            "kyc",
            vec![StageOutcome::await_signal("kyc-1")],
        ));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("verify", "kyc")])).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(outcome, WorkflowOutcome::Failed);
        assert!(harness.services.control.wait("kyc-1").await.unwrap().is_none());

        let rows = harness.executions(&tenant, job_id).await;
        assert_eq!(rows[0].state, StageExecutionState::Failed);
        assert!(rows[0].error.as_deref().unwrap_or_default().contains("does not support suspension"));
    }

    /// Stores a running `verify` row for `job_id`, as left by a process that
    /// died part-way through suspending.
    async fn leave_running_row(
        harness: &TestHarness,
        tenant: &TenantId,
        job_id: Uuid,
        correlation_id: Option<&str>,
    ) -> Uuid {
        let now = harness.clock.now();
        let mut row = StageExecution::new(generate_id(), job_id, "verify", "kyc", 1, now);
        row.start(now).unwrap();
        row.correlation_id = correlation_id.map(str::to_string);
        let id = row.id;
        harness
            .services
            .tenants
            .run(tenant, async move { Ok(TenantContext::scoped_store()?.append_execution(row).await?) })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_awaiting_row_without_wait_is_rerun() {
        let harness = TestHarness::new();
        harness.register(AwaitingCapability::new("kyc", "kyc-1"));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("verify", "kyc")])).await;
        let orphan = leave_running_row(&harness, &tenant, job_id, Some("kyc-1")).await;

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert_eq!(
            outcome,
            WorkflowOutcome::Suspended {
                awaiting: vec!["kyc-1".to_string()]
            }
        );

        let rows = harness.executions(&tenant, job_id).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, orphan);
        assert_eq!(rows[0].state, StageExecutionState::Failed);
        assert!(rows[1].is_awaiting_signal());
        assert_eq!(rows[1].attempt, 2);

        let wait = harness.services.control.wait("kyc-1").await.unwrap().unwrap();
        assert_eq!(wait.execution_id, rows[1].id);
    }

    #[tokio::test]
    async fn test_wait_left_by_interrupted_attempt_is_replaced() {
        let harness = TestHarness::new();
        harness.register(AwaitingCapability::new("kyc", "kyc-1"));
        let (tenant, job_id) =
            setup(&harness, PipelineDefinition::new(vec![StageConfig::new("verify", "kyc")])).await;
        let interrupted = leave_running_row(&harness, &tenant, job_id, None).await;
        let now = harness.clock.now();
        harness
            .services
            .control
            .register_wait(SignalWait {
                correlation_id: "kyc-1".to_string(),
                tenant_id: tenant.clone(),
                workflow_id: job_id,
                stage_id: "verify".to_string(),
                execution_id: interrupted,
                registered_at: now,
                deadline: now + chrono::Duration::hours(24),
            })
            .await
            .unwrap();

        let outcome = harness.workflow_engine().run(&tenant, job_id).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Suspended { .. }));

        let rows = harness.executions(&tenant, job_id).await;
        assert_eq!(rows[0].state, StageExecutionState::Failed);
        assert!(rows[1].is_awaiting_signal());
        let wait = harness.services.control.wait("kyc-1").await.unwrap().unwrap();
        assert_eq!(wait.execution_id, rows[1].id);
    }
}
