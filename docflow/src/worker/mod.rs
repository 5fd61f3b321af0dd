//! Background worker.
//!
//! Takes ready messages off the dispatch queue and routes each to the engine
//! that owns it. Workers share nothing in memory besides the queue and the
//! stores (dispatch leases live in the control store), so any number of them
//! may run side by side. Between polls the worker also sweeps expired signal
//! waits.
//!
//! A message whose handling fails is never just dropped: a transient failure
//! puts it back after [`WorkerConfig::defer_delay`], any other failure
//! settles its job and document as failed.

use crate::config::WorkerConfig;
use crate::core::EventType;
use crate::errors::{DocflowError, StorageError};
use crate::notifications::NotificationService;
use crate::pipeline::{DispatchMessage, EngineServices, PipelineOrchestrator, QueuedMessage, StepOutcome};
use crate::state::{DocumentState, JobState};
use crate::tenant::{TenantContext, TenantStatus};
use crate::workflow::{WorkflowEngine, WorkflowOutcome, WorkflowStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Counters from one [`Worker::run_until_idle`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Messages handled without error.
    pub processed: usize,
    /// Messages whose handling returned an error.
    pub failed: usize,
    /// Messages put back because their job was already in flight.
    pub requeued: usize,
    /// Messages put back after a transient failure.
    pub deferred: usize,
    /// Signal waits timed out by the sweep.
    pub expired_waits: usize,
}

enum Handled {
    Done,
    Busy,
    Deferred,
}

/// Routes dispatch messages to the engines.
#[derive(Debug, Clone)]
pub struct Worker {
    services: EngineServices,
    orchestrator: PipelineOrchestrator,
    workflows: WorkflowEngine,
    notifications: Option<Arc<NotificationService>>,
    config: WorkerConfig,
}

impl Worker {
    /// Creates a worker over both engines.
    #[must_use]
    pub fn new(
        services: EngineServices,
        orchestrator: PipelineOrchestrator,
        workflows: WorkflowEngine,
        config: WorkerConfig,
    ) -> Self {
        Self {
            services,
            orchestrator,
            workflows,
            notifications: None,
            config,
        }
    }

    /// Enables notification retries.
    #[must_use]
    pub fn with_notifications(mut self, notifications: Arc<NotificationService>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Handles messages until none is ready at the current clock time.
    ///
    /// Messages scheduled in the future stay queued; tests advance their
    /// clock and call this again.
    ///
    /// # Errors
    ///
    /// Only queue failures. Handling errors are logged and counted.
    pub async fn run_until_idle(&self) -> Result<WorkerReport, DocflowError> {
        let mut report = WorkerReport {
            expired_waits: self.sweep().await,
            ..WorkerReport::default()
        };
        loop {
            let batch = self
                .services
                .queue
                .dequeue_ready(self.services.clock.now(), self.config.batch_size.max(1))
                .await?;
            if batch.is_empty() {
                break;
            }
            for queued in batch {
                match self.handle(queued).await {
                    Ok(Handled::Done) => report.processed += 1,
                    Ok(Handled::Busy) => report.requeued += 1,
                    Ok(Handled::Deferred) => report.deferred += 1,
                    Err(_) => report.failed += 1,
                }
            }
        }
        Ok(report)
    }

    /// Runs `concurrency` polling tasks plus a wait sweeper until `shutdown`
    /// flips to true.
    ///
    /// Starting the loop ends bootstrap: the capability registry is sealed
    /// and later registrations fail. A message already being handled is
    /// finished before its task exits.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        self.services.registry.seal();
        info!(
            concurrency,
            capabilities = self.services.registry.len(),
            "Worker started; capability registry sealed"
        );

        let mut tasks = JoinSet::new();
        for index in 0..concurrency {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.spawn(
                async move { worker.poll_loop(shutdown).await }.instrument(info_span!("worker", index)),
            );
        }
        let sweeper = Arc::clone(&self);
        tasks.spawn(async move { sweeper.sweep_loop(shutdown).await });

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Worker task aborted");
            }
        }
        info!("Worker stopped");
    }

    async fn poll_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = &self.services.queue;
        while !*shutdown.borrow() {
            let batch = match queue.dequeue_ready(self.services.clock.now(), 1).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(error = %err, "Dequeue failed");
                    Vec::new()
                }
            };
            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = queue.notified() => {}
                    () = tokio::time::sleep(self.config.poll_interval()) => {}
                }
                continue;
            }
            for queued in batch {
                // Errors are logged inside `handle`.
                let _ = self.handle(queued).await;
            }
        }
    }

    async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            self.sweep().await;
            tokio::select! {
                _ = shutdown.changed() => {}
                () = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    async fn sweep(&self) -> usize {
        match self.workflows.expire_waits().await {
            Ok(expired) => {
                if expired > 0 {
                    info!(expired, "Expired signal waits");
                }
                expired
            }
            Err(err) => {
                error!(error = %err, "Signal wait sweep failed");
                0
            }
        }
    }

    async fn handle(&self, queued: QueuedMessage) -> Result<Handled, DocflowError> {
        let message = queued.message;
        let span = info_span!(
            "message",
            kind = message.kind(),
            tenant_id = %message.tenant_id(),
            queue_id = %queued.id
        );
        let result = self.route(&message).instrument(span).await;
        match result {
            Ok(Handled::Busy) => {
                debug!(kind = message.kind(), key = %message.dispatch_key(), "In flight elsewhere; requeueing");
                self.services
                    .queue
                    .enqueue(message, self.config.poll_interval())
                    .await?;
                Ok(Handled::Busy)
            }
            Ok(handled) => Ok(handled),
            Err(err) if self.is_transient(&message, &err).await => {
                let delay = self.config.defer_delay();
                warn!(
                    kind = message.kind(),
                    tenant_id = %message.tenant_id(),
                    key = %message.dispatch_key(),
                    code = err.code(),
                    error = %err,
                    delay_secs = delay.as_secs(),
                    "Transient failure; message deferred"
                );
                self.services.queue.enqueue(message, delay).await?;
                Ok(Handled::Deferred)
            }
            Err(err) => {
                error!(
                    kind = message.kind(),
                    tenant_id = %message.tenant_id(),
                    key = %message.dispatch_key(),
                    code = err.code(),
                    error = %err,
                    "Message handling failed"
                );
                self.abandon(&message, &err).await;
                Err(err)
            }
        }
    }

    /// A suspended (or not yet active) tenant and an unreachable store may
    /// recover; everything else will fail the same way next time.
    async fn is_transient(&self, message: &DispatchMessage, err: &DocflowError) -> bool {
        match err {
            DocflowError::Storage(StorageError::Unavailable(_)) => true,
            DocflowError::TenantUnavailable { .. } => matches!(
                self.services.tenants.tenant(message.tenant_id()).await.map(|t| t.status),
                Ok(TenantStatus::Suspended | TenantStatus::Provisioning)
            ),
            _ => false,
        }
    }

    /// Fails the job behind a message that hit a terminal error, so neither
    /// the job nor its document is left mid-flight with nothing to move it.
    async fn abandon(&self, message: &DispatchMessage, err: &DocflowError) {
        let (tenant_id, job_id) = match message {
            DispatchMessage::PipelineStep { tenant_id, job_id } => (tenant_id, *job_id),
            DispatchMessage::WorkflowRun { tenant_id, workflow_id } => (tenant_id, *workflow_id),
            DispatchMessage::NotificationRetry { .. } => return,
        };
        match self.services.tenants.run(tenant_id, self.fail_job(job_id, err)).await {
            Ok(true) => warn!(job_id = %job_id, code = err.code(), "Job failed after unrecoverable dispatch error"),
            Ok(false) => {}
            Err(settle_err) => {
                error!(job_id = %job_id, error = %settle_err, "Could not fail job after dispatch error");
            }
        }
    }

    async fn fail_job(&self, job_id: Uuid, err: &DocflowError) -> Result<bool, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();
        let mut job = match store.job(job_id).await {
            Ok(job) => job,
            Err(StorageError::NotFound { .. }) => return Ok(false),
            Err(other) => return Err(other.into()),
        };
        if job.is_finished() {
            return Ok(false);
        }

        let stage_id = job
            .pipeline
            .stages
            .get(job.cursor)
            .map(|stage| stage.id.clone())
            .unwrap_or_default();
        job.final_failure = true;
        job.record_error(&stage_id, err.code(), err.to_string(), now);
        if job.state != JobState::Failed {
            if job.state == JobState::Pending {
                job.transition(JobState::Queued, now)?;
            }
            if job.state == JobState::Queued {
                job.transition(JobState::Running, now)?;
            }
            job.transition(JobState::Failed, now)?;
        }
        store.update_job(&job).await?;

        let mut document = store.document(job.document_id).await?;
        if !document.is_terminal() {
            if document.state == DocumentState::Pending {
                document.transition(DocumentState::Queued, now, None)?;
            }
            if document.state == DocumentState::Queued {
                document.start_processing(now)?;
            }
            document.fail(now, err.to_string())?;
            store.update_document(&document).await?;
        }

        if let Some(mut checkpoint) = store.checkpoint(job.id).await? {
            checkpoint.status = WorkflowStatus::Failed;
            checkpoint.awaiting.clear();
            checkpoint.touch(now);
            store.save_checkpoint(checkpoint).await?;
        }
        for wait in self.services.control.remove_waits_for_workflow(job.id).await? {
            let mut row = store.execution(wait.execution_id).await?;
            if !row.is_terminal() {
                row.fail("workflow failed", now)?;
                store.update_execution(&row).await?;
            }
        }

        self.services
            .emit(
                EventType::DocumentFailed,
                &job,
                serde_json::json!({ "stage_id": stage_id, "error": err.to_string(), "code": err.code() }),
            )
            .await;
        Ok(true)
    }

    async fn route(&self, message: &DispatchMessage) -> Result<Handled, DocflowError> {
        match message {
            DispatchMessage::PipelineStep { tenant_id, job_id } => {
                let outcome = self.orchestrator.dispatch(tenant_id, *job_id).await?;
                debug!(job_id = %job_id, outcome = ?outcome, "Pipeline step handled");
                Ok(if outcome == StepOutcome::Busy {
                    Handled::Busy
                } else {
                    Handled::Done
                })
            }
            DispatchMessage::WorkflowRun { tenant_id, workflow_id } => {
                let outcome = self.workflows.run(tenant_id, *workflow_id).await?;
                debug!(workflow_id = %workflow_id, outcome = ?outcome, "Workflow run handled");
                Ok(if outcome == WorkflowOutcome::Busy {
                    Handled::Busy
                } else {
                    Handled::Done
                })
            }
            DispatchMessage::NotificationRetry {
                tenant_id,
                delivery_id,
                attempt,
            } => {
                let Some(notifications) = &self.notifications else {
                    warn!(delivery_id = %delivery_id, "Notification retry dropped; notifications disabled");
                    return Ok(Handled::Done);
                };
                let retry = notifications.retry(tenant_id, *delivery_id, *attempt);
                match self.services.guard.run_exclusive(message.dispatch_key(), retry).await? {
                    Some(result) => {
                        result?;
                        Ok(Handled::Done)
                    }
                    None => Ok(Handled::Busy),
                }
            }
        }
    }
}
