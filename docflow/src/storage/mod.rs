//! Storage traits and in-memory backends.
//!
//! Two kinds of store exist:
//!
//! - [`TenantStore`]: one per tenant, holding that tenant's documents, jobs,
//!   stage executions, delivery records and workflow checkpoints. Only
//!   reachable through a bound [`TenantContext`](crate::tenant::TenantContext).
//! - [`ControlStore`]: shared, tenant-independent state (the tenant registry,
//!   signal waits and the received-signal log). It holds routing data only,
//!   never tenant documents.

mod control;
mod memory;

pub use control::InMemoryControlStore;
pub use memory::{InMemoryStoreFactory, InMemoryTenantStore};

use crate::campaign::Campaign;
use crate::errors::StorageError;
use crate::notifications::DeliveryRecord;
use crate::state::{Document, Job, StageExecution};
use crate::tenant::{Tenant, TenantId};
use crate::workflow::{ReceivedSignal, SignalWait, WorkflowCheckpoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A single tenant's isolated store.
#[async_trait]
pub trait TenantStore: Send + Sync + Debug {
    /// The tenant this store belongs to.
    fn tenant_id(&self) -> &TenantId;

    /// Inserts or replaces a campaign.
    async fn put_campaign(&self, campaign: Campaign) -> StorageResult<()>;

    /// Loads a campaign.
    async fn campaign(&self, id: Uuid) -> StorageResult<Campaign>;

    /// Inserts a new document.
    async fn insert_document(&self, document: Document) -> StorageResult<()>;

    /// Loads a document.
    async fn document(&self, id: Uuid) -> StorageResult<Document>;

    /// Replaces an existing document.
    ///
    /// Fails with [`StorageError::ImmutableRecord`] if the stored document is
    /// already terminal.
    async fn update_document(&self, document: &Document) -> StorageResult<()>;

    /// Returns documents with the given content hash.
    async fn find_documents_by_hash(&self, content_hash: &str) -> StorageResult<Vec<Document>>;

    /// Inserts a new job.
    async fn insert_job(&self, job: Job) -> StorageResult<()>;

    /// Loads a job.
    async fn job(&self, id: Uuid) -> StorageResult<Job>;

    /// Replaces an existing job.
    ///
    /// Fails with [`StorageError::ImmutableRecord`] if the stored job is
    /// finished.
    async fn update_job(&self, job: &Job) -> StorageResult<()>;

    /// Returns the jobs created for a document, oldest first.
    async fn jobs_for_document(&self, document_id: Uuid) -> StorageResult<Vec<Job>>;

    /// Appends a stage execution row.
    async fn append_execution(&self, execution: StageExecution) -> StorageResult<()>;

    /// Replaces a stage execution row.
    ///
    /// Fails with [`StorageError::ImmutableRecord`] if the stored row is
    /// already terminal.
    async fn update_execution(&self, execution: &StageExecution) -> StorageResult<()>;

    /// Loads one stage execution row.
    async fn execution(&self, id: Uuid) -> StorageResult<StageExecution>;

    /// Returns a job's stage executions in append order.
    async fn executions_for_job(&self, job_id: Uuid) -> StorageResult<Vec<StageExecution>>;

    /// Appends a notification delivery record.
    async fn append_delivery(&self, record: DeliveryRecord) -> StorageResult<()>;

    /// Returns every attempt recorded for a delivery id, in append order.
    async fn delivery_attempts(&self, delivery_id: Uuid) -> StorageResult<Vec<DeliveryRecord>>;

    /// Returns every delivery record of a campaign.
    async fn deliveries_for_campaign(&self, campaign_id: Uuid) -> StorageResult<Vec<DeliveryRecord>>;

    /// Writes the checkpoint of a workflow.
    async fn save_checkpoint(&self, checkpoint: WorkflowCheckpoint) -> StorageResult<()>;

    /// Loads the checkpoint of a workflow, if any.
    async fn checkpoint(&self, workflow_id: Uuid) -> StorageResult<Option<WorkflowCheckpoint>>;
}

/// Tenant-independent control-plane state.
#[async_trait]
pub trait ControlStore: Send + Sync + Debug {
    /// Registers a tenant.
    async fn insert_tenant(&self, tenant: Tenant) -> StorageResult<()>;

    /// Loads a tenant.
    async fn tenant(&self, id: &TenantId) -> StorageResult<Tenant>;

    /// Replaces a tenant record.
    async fn update_tenant(&self, tenant: &Tenant) -> StorageResult<()>;

    /// Lists every tenant.
    async fn tenants(&self) -> StorageResult<Vec<Tenant>>;

    /// Registers a signal wait. Fails with a conflict if the correlation id
    /// is already awaited.
    async fn register_wait(&self, wait: SignalWait) -> StorageResult<()>;

    /// Looks up the wait for a correlation id.
    async fn wait(&self, correlation_id: &str) -> StorageResult<Option<SignalWait>>;

    /// Atomically removes and returns the wait for a correlation id.
    ///
    /// At most one caller ever receives a given wait.
    async fn take_wait(&self, correlation_id: &str) -> StorageResult<Option<SignalWait>>;

    /// Removes every wait registered by a workflow.
    async fn remove_waits_for_workflow(&self, workflow_id: Uuid) -> StorageResult<Vec<SignalWait>>;

    /// Returns waits whose deadline is at or before `now`.
    async fn expired_waits(&self, now: DateTime<Utc>) -> StorageResult<Vec<SignalWait>>;

    /// Records a received signal.
    ///
    /// Returns `false` (and stores nothing) if a signal with the same
    /// correlation id was already recorded.
    async fn record_signal(&self, signal: ReceivedSignal) -> StorageResult<bool>;

    /// Loads a received signal.
    async fn signal(&self, correlation_id: &str) -> StorageResult<Option<ReceivedSignal>>;

    /// Marks a received signal as consumed by a workflow.
    async fn mark_signal_consumed(&self, correlation_id: &str, workflow_id: Uuid) -> StorageResult<()>;

    /// Takes the dispatch lease on `key` for `token` until `expires_at`.
    ///
    /// Returns `false` while another token holds a lease that is still live
    /// at `now`. An expired lease is taken over.
    async fn acquire_lease(
        &self,
        key: &str,
        token: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Moves the expiry of a lease held by `token`. Returns `false` if the
    /// lease was released or taken over.
    async fn renew_lease(&self, key: &str, token: Uuid, expires_at: DateTime<Utc>) -> StorageResult<bool>;

    /// Drops the lease on `key` if `token` still holds it.
    async fn release_lease(&self, key: &str, token: Uuid) -> StorageResult<()>;

    /// Expiry of the lease recorded on `key`, live or not.
    async fn lease_expiry(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>>;
}

/// Opens a tenant's isolated store from its storage locator.
pub trait StoreFactory: Send + Sync + Debug {
    /// Opens (or reuses) the store for `tenant`.
    fn open(&self, tenant: &Tenant) -> StorageResult<Arc<dyn TenantStore>>;
}
