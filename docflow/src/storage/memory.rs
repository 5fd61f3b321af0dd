//! In-memory tenant stores.

use super::{StorageResult, StoreFactory, TenantStore};
use crate::campaign::Campaign;
use crate::errors::StorageError;
use crate::notifications::DeliveryRecord;
use crate::state::{Document, Job, StageExecution};
use crate::tenant::{Tenant, TenantId};
use crate::workflow::WorkflowCheckpoint;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// One tenant's data held in memory.
#[derive(Debug)]
pub struct InMemoryTenantStore {
    tenant_id: TenantId,
    campaigns: DashMap<Uuid, Campaign>,
    documents: DashMap<Uuid, Document>,
    jobs: DashMap<Uuid, Job>,
    executions: RwLock<Vec<StageExecution>>,
    deliveries: RwLock<Vec<DeliveryRecord>>,
    checkpoints: DashMap<Uuid, WorkflowCheckpoint>,
}

impl InMemoryTenantStore {
    /// Creates an empty store for a tenant.
    #[must_use]
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            campaigns: DashMap::new(),
            documents: DashMap::new(),
            jobs: DashMap::new(),
            executions: RwLock::new(Vec::new()),
            deliveries: RwLock::new(Vec::new()),
            checkpoints: DashMap::new(),
        }
    }

    /// Returns the number of stored documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    async fn put_campaign(&self, campaign: Campaign) -> StorageResult<()> {
        self.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn campaign(&self, id: Uuid) -> StorageResult<Campaign> {
        self.campaigns
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| StorageError::not_found("campaign", id))
    }

    async fn insert_document(&self, document: Document) -> StorageResult<()> {
        if self.documents.contains_key(&document.id) {
            return Err(StorageError::conflict("document", document.id));
        }
        self.documents.insert(document.id, document);
        Ok(())
    }

    async fn document(&self, id: Uuid) -> StorageResult<Document> {
        self.documents
            .get(&id)
            .map(|d| d.clone())
            .ok_or_else(|| StorageError::not_found("document", id))
    }

    async fn update_document(&self, document: &Document) -> StorageResult<()> {
        let mut slot = self
            .documents
            .get_mut(&document.id)
            .ok_or_else(|| StorageError::not_found("document", document.id))?;
        if slot.is_terminal() {
            return Err(StorageError::ImmutableRecord {
                entity: "document",
                id: document.id.to_string(),
            });
        }
        *slot = document.clone();
        Ok(())
    }

    async fn find_documents_by_hash(&self, content_hash: &str) -> StorageResult<Vec<Document>> {
        let mut found: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| d.content_hash == content_hash)
            .map(|d| d.clone())
            .collect();
        found.sort_by_key(|d| d.created_at);
        Ok(found)
    }

    async fn insert_job(&self, job: Job) -> StorageResult<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(StorageError::conflict("job", job.id));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn job(&self, id: Uuid) -> StorageResult<Job> {
        self.jobs
            .get(&id)
            .map(|j| j.clone())
            .ok_or_else(|| StorageError::not_found("job", id))
    }

    async fn update_job(&self, job: &Job) -> StorageResult<()> {
        let mut slot = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StorageError::not_found("job", job.id))?;
        if slot.is_finished() {
            return Err(StorageError::ImmutableRecord {
                entity: "job",
                id: job.id.to_string(),
            });
        }
        *slot = job.clone();
        Ok(())
    }

    async fn jobs_for_document(&self, document_id: Uuid) -> StorageResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.document_id == document_id)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn append_execution(&self, execution: StageExecution) -> StorageResult<()> {
        let mut rows = self.executions.write();
        if rows.iter().any(|row| row.id == execution.id) {
            return Err(StorageError::conflict("stage_execution", execution.id));
        }
        rows.push(execution);
        Ok(())
    }

    async fn update_execution(&self, execution: &StageExecution) -> StorageResult<()> {
        let mut rows = self.executions.write();
        let row = rows
            .iter_mut()
            .find(|row| row.id == execution.id)
            .ok_or_else(|| StorageError::not_found("stage_execution", execution.id))?;
        if row.is_terminal() {
            return Err(StorageError::ImmutableRecord {
                entity: "stage_execution",
                id: execution.id.to_string(),
            });
        }
        *row = execution.clone();
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> StorageResult<StageExecution> {
        self.executions
            .read()
            .iter()
            .find(|row| row.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("stage_execution", id))
    }

    async fn executions_for_job(&self, job_id: Uuid) -> StorageResult<Vec<StageExecution>> {
        Ok(self
            .executions
            .read()
            .iter()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn append_delivery(&self, record: DeliveryRecord) -> StorageResult<()> {
        self.deliveries.write().push(record);
        Ok(())
    }

    async fn delivery_attempts(&self, delivery_id: Uuid) -> StorageResult<Vec<DeliveryRecord>> {
        Ok(self
            .deliveries
            .read()
            .iter()
            .filter(|r| r.delivery_id == delivery_id)
            .cloned()
            .collect())
    }

    async fn deliveries_for_campaign(&self, campaign_id: Uuid) -> StorageResult<Vec<DeliveryRecord>> {
        Ok(self
            .deliveries
            .read()
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn save_checkpoint(&self, checkpoint: WorkflowCheckpoint) -> StorageResult<()> {
        self.checkpoints.insert(checkpoint.workflow_id, checkpoint);
        Ok(())
    }

    async fn checkpoint(&self, workflow_id: Uuid) -> StorageResult<Option<WorkflowCheckpoint>> {
        Ok(self.checkpoints.get(&workflow_id).map(|c| c.clone()))
    }
}

/// Opens one [`InMemoryTenantStore`] per storage locator.
///
/// Reopening the same locator returns the same store, so data survives
/// across tenant bindings the way a database would.
#[derive(Debug, Default)]
pub struct InMemoryStoreFactory {
    stores: DashMap<String, Arc<InMemoryTenantStore>>,
}

impl InMemoryStoreFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the concrete store behind a locator, if opened.
    #[must_use]
    pub fn store(&self, storage_locator: &str) -> Option<Arc<InMemoryTenantStore>> {
        self.stores.get(storage_locator).map(|s| Arc::clone(&s))
    }
}

impl StoreFactory for InMemoryStoreFactory {
    fn open(&self, tenant: &Tenant) -> StorageResult<Arc<dyn TenantStore>> {
        let store = self
            .stores
            .entry(tenant.storage_locator.clone())
            .or_insert_with(|| Arc::new(InMemoryTenantStore::new(tenant.id.clone())))
            .clone();

        // A locator belongs to exactly one tenant.
        if store.tenant_id != tenant.id {
            return Err(StorageError::conflict("storage_locator", &tenant.storage_locator));
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EngineKind, PipelineDefinition, StageConfig};
    use crate::state::{JobState, StageExecutionState};
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    fn row(job_id: Uuid) -> StageExecution {
        StageExecution::new(Uuid::new_v4(), job_id, "extract", "extractor", 1, Utc::now())
    }

    #[tokio::test]
    async fn test_terminal_rows_are_immutable() {
        let store = InMemoryTenantStore::new(TenantId::new("acme"));
        let mut exec = row(Uuid::new_v4());
        assert_ok!(store.append_execution(exec.clone()).await);

        exec.start(Utc::now()).unwrap();
        assert_ok!(store.update_execution(&exec).await);
        exec.complete(serde_json::Map::new(), Utc::now()).unwrap();
        assert_ok!(store.update_execution(&exec).await);

        exec.output.insert("tampered".into(), serde_json::json!(true));
        let err = store.update_execution(&exec).await.unwrap_err();
        assert!(matches!(err, StorageError::ImmutableRecord { .. }));

        let stored = store.execution(exec.id).await.unwrap();
        assert_eq!(stored.state, StageExecutionState::Completed);
        assert!(stored.output.get("tampered").is_none());
    }

    fn job(max_attempts: u32) -> Job {
        Job::new(
            Uuid::new_v4(),
            TenantId::new("acme"),
            Uuid::new_v4(),
            Uuid::new_v4(),
            EngineKind::Workflow,
            PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")]),
            max_attempts,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_cancelled_job_cannot_be_overwritten() {
        let store = InMemoryTenantStore::new(TenantId::new("acme"));
        let mut job = job(3);
        assert_ok!(store.insert_job(job.clone()).await);
        let stale = {
            job.transition(JobState::Queued, Utc::now()).unwrap();
            job.transition(JobState::Running, Utc::now()).unwrap();
            assert_ok!(store.update_job(&job).await);
            job.clone()
        };

        job.transition(JobState::Cancelled, Utc::now()).unwrap();
        assert_ok!(store.update_job(&job).await);

        let err = store.update_job(&stale).await.unwrap_err();
        assert!(matches!(err, StorageError::ImmutableRecord { entity: "job", .. }));
        assert_eq!(store.job(job.id).await.unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_retryable_failed_job_stays_writable() {
        let store = InMemoryTenantStore::new(TenantId::new("acme"));
        let mut job = job(3);
        assert_ok!(store.insert_job(job.clone()).await);
        job.transition(JobState::Queued, Utc::now()).unwrap();
        job.transition(JobState::Running, Utc::now()).unwrap();
        job.attempts = 1;
        job.transition(JobState::Failed, Utc::now()).unwrap();
        assert_ok!(store.update_job(&job).await);

        job.transition(JobState::Queued, Utc::now()).unwrap();
        assert_ok!(store.update_job(&job).await);
        assert_eq!(store.job(job.id).await.unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_executions_keep_append_order() {
        let store = InMemoryTenantStore::new(TenantId::new("acme"));
        let job_id = Uuid::new_v4();
        let first = row(job_id);
        let second = row(job_id);
        store.append_execution(first.clone()).await.unwrap();
        store.append_execution(row(Uuid::new_v4())).await.unwrap();
        store.append_execution(second.clone()).await.unwrap();

        let rows = store.executions_for_job(job_id).await.unwrap();
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_duplicate_append_conflicts() {
        let store = InMemoryTenantStore::new(TenantId::new("acme"));
        let exec = row(Uuid::new_v4());
        assert_ok!(store.append_execution(exec.clone()).await);
        assert_err!(store.append_execution(exec).await);
    }

    #[test]
    fn test_factory_reuses_store_per_locator() {
        let factory = InMemoryStoreFactory::new();
        let acme = Tenant::new(TenantId::new("acme"), "Acme", "mem://acme", Utc::now());
        let a = factory.open(&acme).unwrap();
        let b = factory.open(&acme).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_factory_rejects_shared_locator() {
        let factory = InMemoryStoreFactory::new();
        let acme = Tenant::new(TenantId::new("acme"), "Acme", "mem://shared", Utc::now());
        let globex = Tenant::new(TenantId::new("globex"), "Globex", "mem://shared", Utc::now());
        factory.open(&acme).unwrap();
        assert!(factory.open(&globex).is_err());
    }
}
