//! Document intake: campaigns, submission and cancellation.

use crate::campaign::Campaign;
use crate::core::EventType;
use crate::errors::DocflowError;
use crate::pipeline::{DispatchMessage, EngineKind, EngineServices};
use crate::state::{Document, Job, JobState, NewDocument};
use crate::tenant::{TenantContext, TenantId};
use crate::utils::generate_id;
use crate::workflow::{WorkflowCheckpoint, WorkflowStatus};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Ids of a submitted document and the job created for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// The new document.
    pub document_id: Uuid,
    /// The job processing it.
    pub job_id: Uuid,
}

/// Entry point for new work.
///
/// Every operation binds the tenant itself, so callers only pass the
/// durable tenant id.
#[derive(Debug, Clone)]
pub struct DocumentIntake {
    services: EngineServices,
    default_max_attempts: u32,
}

impl DocumentIntake {
    /// Creates an intake. `default_max_attempts` applies to campaigns that
    /// leave their own limit at zero.
    #[must_use]
    pub fn new(services: EngineServices, default_max_attempts: u32) -> Self {
        Self {
            services,
            default_max_attempts,
        }
    }

    /// Validates and stores a campaign.
    pub async fn create_campaign(&self, tenant_id: &TenantId, campaign: Campaign) -> Result<(), DocflowError> {
        self.services.registry.validate_pipeline(&campaign.pipeline)?;
        self.services
            .tenants
            .run(tenant_id, async move {
                let store = TenantContext::scoped_store()?;
                info!(
                    tenant_id = %store.tenant_id(),
                    campaign_id = %campaign.id,
                    engine = %campaign.engine,
                    stages = campaign.pipeline.len(),
                    "Campaign stored"
                );
                store.put_campaign(campaign).await?;
                Ok(())
            })
            .await
    }

    /// Creates a document and its job, queues both and enqueues the first
    /// dispatch for the campaign's engine.
    ///
    /// # Errors
    ///
    /// Unknown campaign, or tenant and storage failures. Capabilities are
    /// resolved when each stage runs, not here.
    pub async fn submit(&self, tenant_id: &TenantId, input: NewDocument) -> Result<Submission, DocflowError> {
        self.services.tenants.run(tenant_id, self.create(input)).await
    }

    async fn create(&self, input: NewDocument) -> Result<Submission, DocflowError> {
        let tenant = TenantContext::require()?;
        let store = tenant.store();
        let tenant_id = tenant.tenant_id().clone();
        let now = self.services.clock.now();

        let campaign = store.campaign(input.campaign_id).await?;

        let max_attempts = if campaign.max_attempts == 0 {
            self.default_max_attempts
        } else {
            campaign.max_attempts
        };
        let mut document = Document::new(generate_id(), tenant_id.clone(), input, now);
        let mut job = Job::new(
            generate_id(),
            tenant_id.clone(),
            document.id,
            campaign.id,
            campaign.engine,
            campaign.pipeline.clone(),
            max_attempts,
            now,
        );
        document.queue(now)?;
        job.transition(JobState::Queued, now)?;
        store.insert_document(document.clone()).await?;
        store.insert_job(job.clone()).await?;

        let message = match campaign.engine {
            EngineKind::Pipeline => DispatchMessage::PipelineStep {
                tenant_id: tenant_id.clone(),
                job_id: job.id,
            },
            EngineKind::Workflow => {
                store
                    .save_checkpoint(WorkflowCheckpoint::new(job.id, tenant_id.clone(), now))
                    .await?;
                DispatchMessage::WorkflowRun {
                    tenant_id: tenant_id.clone(),
                    workflow_id: job.id,
                }
            }
        };
        self.services.queue.enqueue(message, Duration::ZERO).await?;

        info!(
            tenant_id = %tenant_id,
            document_id = %document.id,
            job_id = %job.id,
            engine = %job.engine,
            "Document submitted"
        );
        Ok(Submission {
            document_id: document.id,
            job_id: job.id,
        })
    }

    /// Records cooperative cancellation of a job.
    ///
    /// A stage already running is allowed to finish, but nothing is
    /// dispatched afterwards. Pending signal waits are dropped.
    ///
    /// # Errors
    ///
    /// [`DocflowError::TransitionNotAllowed`] if the job already finished.
    pub async fn cancel(&self, tenant_id: &TenantId, job_id: Uuid) -> Result<(), DocflowError> {
        self.services.tenants.run(tenant_id, self.record_cancel(job_id)).await
    }

    async fn record_cancel(&self, job_id: Uuid) -> Result<(), DocflowError> {
        let store = TenantContext::scoped_store()?;
        let now = self.services.clock.now();

        let mut job = store.job(job_id).await?;
        job.transition(JobState::Cancelled, now)?;
        store.update_job(&job).await?;

        let mut document = store.document(job.document_id).await?;
        if !document.is_terminal() {
            document.cancel(now)?;
            store.update_document(&document).await?;
        }

        for wait in self.services.control.remove_waits_for_workflow(job.id).await? {
            let mut row = store.execution(wait.execution_id).await?;
            if !row.is_terminal() {
                warn!(job_id = %job.id, correlation_id = %wait.correlation_id, "Dropping signal wait");
                row.fail("cancelled", now)?;
                store.update_execution(&row).await?;
            }
        }

        if let Some(mut checkpoint) = store.checkpoint(job.id).await? {
            checkpoint.status = WorkflowStatus::Cancelled;
            checkpoint.awaiting.clear();
            checkpoint.touch(now);
            store.save_checkpoint(checkpoint).await?;
        }

        info!(job_id = %job.id, document_id = %document.id, "Job cancelled");
        self.services
            .emit(EventType::DocumentCancelled, &job, serde_json::json!({}))
            .await;
        Ok(())
    }

    /// Returns a tenant's documents with the given content hash.
    pub async fn find_by_hash(&self, tenant_id: &TenantId, content_hash: &str) -> Result<Vec<Document>, DocflowError> {
        self.services
            .tenants
            .run(tenant_id, async {
                Ok(TenantContext::scoped_store()?
                    .find_documents_by_hash(content_hash)
                    .await?)
            })
            .await
    }
}
