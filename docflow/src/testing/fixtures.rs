//! An in-memory deployment for tests.

use std::sync::Arc;

use uuid::Uuid;

use crate::campaign::{Campaign, NotificationSettings};
use crate::config::DocflowConfig;
use crate::events::{CollectingEventSink, FanoutEventSink};
use crate::ingest::DocumentIntake;
use crate::notifications::{DeliveryRecord, NotificationEventSink, NotificationService};
use crate::pipeline::{
    DispatchGuard, EngineKind, EngineServices, InMemoryJobQueue, JobQueue, PipelineDefinition, PipelineOrchestrator,
};
use crate::stages::{CapabilityRegistry, StageCapability};
use crate::state::{DocumentState, Job, NewDocument, StageExecution};
use crate::storage::{ControlStore, InMemoryControlStore, InMemoryStoreFactory};
use crate::tenant::{TenantContext, TenantId, TenantManager};
use crate::utils::{generate_id, Clock, ManualClock};
use crate::worker::{Worker, WorkerReport};
use crate::workflow::WorkflowEngine;

use super::mocks::RecordingTransport;

/// Builds a [`NewDocument`] for `campaign_id` with the given content hash.
#[must_use]
pub fn new_document(campaign_id: Uuid, content_hash: &str) -> NewDocument {
    NewDocument {
        campaign_id,
        filename: format!("{content_hash}.pdf"),
        content_hash: content_hash.to_string(),
        storage_locator: format!("memory://documents/{content_hash}"),
        mime_type: "application/pdf".to_string(),
        size_bytes: 1024,
        metadata: std::collections::HashMap::new(),
    }
}

/// A single-process deployment over in-memory stores and a manual clock.
///
/// Engines, the intake and the worker are built on demand from `config`,
/// so a test may tweak `config` before asking for them. Lifecycle events go
/// to `events` and to the notification service, whose webhook calls land in
/// `transport`.
///
/// Helper methods panic on failure; they are meant for tests only.
#[derive(Debug)]
pub struct TestHarness {
    /// Shared engine collaborators.
    pub services: EngineServices,
    /// Configuration used to build engines.
    pub config: DocflowConfig,
    /// The dispatch queue, with its scheduling history.
    pub queue: Arc<InMemoryJobQueue>,
    /// The clock every component reads.
    pub clock: Arc<ManualClock>,
    /// Every lifecycle event emitted.
    pub events: Arc<CollectingEventSink>,
    /// Webhook requests made by notifications.
    pub transport: Arc<RecordingTransport>,
    /// The notification service wired into the event sinks.
    pub notifications: Arc<NotificationService>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness whose webhook endpoint accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::with_transport(RecordingTransport::new())
    }

    /// Creates a harness around a specific webhook transport.
    #[must_use]
    pub fn with_transport(transport: RecordingTransport) -> Self {
        let config = DocflowConfig::default();
        let clock = Arc::new(ManualClock::default());
        let control: Arc<dyn ControlStore> = Arc::new(InMemoryControlStore::new());
        let tenants = TenantManager::new(control.clone(), Arc::new(InMemoryStoreFactory::new()), clock.clone());
        let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
        let transport = Arc::new(transport);
        let notifications = Arc::new(NotificationService::new(
            transport.clone(),
            queue.clone(),
            clock.clone(),
            tenants.clone(),
            config.notifications.clone(),
        ));
        let events = Arc::new(CollectingEventSink::new());
        let sink = FanoutEventSink::new()
            .with(events.clone())
            .with(Arc::new(NotificationEventSink::new(notifications.clone())));

        let services = EngineServices {
            tenants,
            control: control.clone(),
            registry: Arc::new(CapabilityRegistry::new()),
            queue: queue.clone(),
            guard: DispatchGuard::new(control.clone(), config.worker.lease_ttl(), clock.clone()),
            events: Arc::new(sink),
            clock: clock.clone(),
        };

        Self {
            services,
            config,
            queue,
            clock,
            events,
            transport,
            notifications,
        }
    }

    /// Registers a capability under its own name.
    ///
    /// # Panics
    ///
    /// If the name is already taken.
    pub fn register<C: StageCapability + 'static>(&self, capability: C) {
        let name = capability.name().to_string();
        self.services
            .registry
            .register(name, Arc::new(capability))
            .expect("capability registers");
    }

    /// Provisions and activates a tenant named `name`.
    ///
    /// # Panics
    ///
    /// If the tenant already exists.
    pub async fn tenant(&self, name: &str) -> TenantId {
        let id = TenantId::new(name);
        self.services
            .tenants
            .provision(id.clone(), name, format!("memory://{name}"))
            .await
            .expect("tenant provisions");
        self.services.tenants.activate(&id).await.expect("tenant activates");
        id
    }

    /// Stores a baseline-engine campaign without checking its capabilities.
    pub async fn campaign(&self, tenant: &TenantId, pipeline: PipelineDefinition) -> Uuid {
        self.store_campaign(tenant, self.new_campaign(pipeline)).await
    }

    /// Stores a durable-workflow campaign without checking its capabilities.
    pub async fn workflow_campaign(&self, tenant: &TenantId, pipeline: PipelineDefinition) -> Uuid {
        self.store_campaign(tenant, self.new_campaign(pipeline).with_engine(EngineKind::Workflow))
            .await
    }

    /// Stores a baseline-engine campaign that notifies `endpoint`.
    pub async fn notifying_campaign(
        &self,
        tenant: &TenantId,
        pipeline: PipelineDefinition,
        settings: NotificationSettings,
    ) -> Uuid {
        self.store_campaign(tenant, self.new_campaign(pipeline).with_notifications(settings))
            .await
    }

    /// Stores a campaign as given.
    ///
    /// # Panics
    ///
    /// On tenant or storage failures.
    pub async fn store_campaign(&self, tenant: &TenantId, campaign: Campaign) -> Uuid {
        let id = campaign.id;
        self.services
            .tenants
            .run(tenant, async move {
                Ok(TenantContext::scoped_store()?.put_campaign(campaign).await?)
            })
            .await
            .expect("campaign stored");
        id
    }

    fn new_campaign(&self, pipeline: PipelineDefinition) -> Campaign {
        Campaign::new(generate_id(), "test campaign", pipeline, self.clock.now())
            .with_max_attempts(self.config.orchestrator.default_max_attempts)
    }

    /// Submits a document; returns `(document_id, job_id)`.
    ///
    /// # Panics
    ///
    /// If the intake rejects the submission.
    pub async fn submit(&self, tenant: &TenantId, campaign_id: Uuid, content_hash: &str) -> (Uuid, Uuid) {
        let submission = self
            .intake()
            .submit(tenant, new_document(campaign_id, content_hash))
            .await
            .expect("document submitted");
        (submission.document_id, submission.job_id)
    }

    /// A document intake over this deployment.
    #[must_use]
    pub fn intake(&self) -> DocumentIntake {
        DocumentIntake::new(self.services.clone(), self.config.orchestrator.default_max_attempts)
    }

    /// A baseline orchestrator built from the current config.
    #[must_use]
    pub fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(self.services.clone(), self.config.orchestrator.clone())
    }

    /// A workflow engine built from the current config.
    #[must_use]
    pub fn workflow_engine(&self) -> WorkflowEngine {
        WorkflowEngine::new(
            self.services.clone(),
            self.config.workflow.clone(),
            self.config.orchestrator.backoff.clone(),
        )
    }

    /// A worker over both engines and the notification service.
    #[must_use]
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.services.clone(),
            self.orchestrator(),
            self.workflow_engine(),
            self.config.worker.clone(),
        )
        .with_notifications(self.notifications.clone())
    }

    /// Handles every message ready at the current clock time.
    ///
    /// # Panics
    ///
    /// On queue failures.
    pub async fn drain(&self) -> WorkerReport {
        self.worker().run_until_idle().await.expect("queue drains")
    }

    /// Drains the queue, jumping the clock to each scheduled message, until
    /// nothing is left.
    ///
    /// # Panics
    ///
    /// On queue failures, or if work keeps rescheduling itself.
    pub async fn run_to_completion(&self) -> WorkerReport {
        let worker = self.worker();
        let mut total = WorkerReport::default();
        for _ in 0..1000 {
            let report = worker.run_until_idle().await.expect("queue drains");
            total.processed += report.processed;
            total.failed += report.failed;
            total.requeued += report.requeued;
            total.deferred += report.deferred;
            total.expired_waits += report.expired_waits;
            match self.queue.next_ready_at().await {
                Some(ready_at) => {
                    if ready_at > self.clock.now() {
                        self.clock.set(ready_at);
                    }
                }
                None => return total,
            }
        }
        panic!("queue did not settle");
    }

    /// Loads a job.
    ///
    /// # Panics
    ///
    /// If the job does not exist.
    pub async fn job(&self, tenant: &TenantId, job_id: Uuid) -> Job {
        self.services
            .tenants
            .run(tenant, async { Ok(TenantContext::scoped_store()?.job(job_id).await?) })
            .await
            .expect("job exists")
    }

    /// Loads a job's execution rows in append order.
    ///
    /// # Panics
    ///
    /// On tenant or storage failures.
    pub async fn executions(&self, tenant: &TenantId, job_id: Uuid) -> Vec<StageExecution> {
        self.services
            .tenants
            .run(tenant, async {
                Ok(TenantContext::scoped_store()?.executions_for_job(job_id).await?)
            })
            .await
            .expect("executions load")
    }

    /// State of the document processed by `job_id`.
    ///
    /// # Panics
    ///
    /// If the job or document does not exist.
    pub async fn document_state(&self, tenant: &TenantId, job_id: Uuid) -> DocumentState {
        self.services
            .tenants
            .run(tenant, async {
                let store = TenantContext::scoped_store()?;
                let job = store.job(job_id).await?;
                Ok(store.document(job.document_id).await?.state)
            })
            .await
            .expect("document exists")
    }

    /// Delivery records of a campaign in append order.
    ///
    /// # Panics
    ///
    /// On tenant or storage failures.
    pub async fn deliveries(&self, tenant: &TenantId, campaign_id: Uuid) -> Vec<DeliveryRecord> {
        self.services
            .tenants
            .run(tenant, async {
                Ok(TenantContext::scoped_store()?
                    .deliveries_for_campaign(campaign_id)
                    .await?)
            })
            .await
            .expect("deliveries load")
    }
}
