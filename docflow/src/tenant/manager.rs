//! Tenant registry operations and binding.

use super::{Tenant, TenantContext, TenantId, TenantStatus};
use crate::errors::{DocflowError, StorageError};
use crate::storage::{ControlStore, StoreFactory};
use crate::utils::Clock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Provisions tenants and re-establishes tenant bindings from durable ids.
#[derive(Debug, Clone)]
pub struct TenantManager {
    control: Arc<dyn ControlStore>,
    factory: Arc<dyn StoreFactory>,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        control: Arc<dyn ControlStore>,
        factory: Arc<dyn StoreFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            control,
            factory,
            clock,
        }
    }

    /// Registers a new tenant in `Provisioning` and opens its store.
    pub async fn provision(
        &self,
        id: impl Into<TenantId>,
        name: impl Into<String>,
        storage_locator: impl Into<String>,
    ) -> Result<Tenant, DocflowError> {
        let tenant = Tenant::new(id.into(), name, storage_locator, self.clock.now());
        self.factory.open(&tenant)?;
        self.control.insert_tenant(tenant.clone()).await?;
        info!(tenant_id = %tenant.id, "Tenant provisioned");
        Ok(tenant)
    }

    /// Provisioning/Suspended -> Active.
    pub async fn activate(&self, id: &TenantId) -> Result<Tenant, DocflowError> {
        self.set_status(id, TenantStatus::Active).await
    }

    /// Active -> Suspended.
    pub async fn suspend(&self, id: &TenantId) -> Result<Tenant, DocflowError> {
        self.set_status(id, TenantStatus::Suspended).await
    }

    /// Any non-archived state -> Archived.
    pub async fn archive(&self, id: &TenantId) -> Result<Tenant, DocflowError> {
        self.set_status(id, TenantStatus::Archived).await
    }

    /// Loads a tenant record.
    pub async fn tenant(&self, id: &TenantId) -> Result<Tenant, DocflowError> {
        Ok(self.control.tenant(id).await?)
    }

    async fn set_status(&self, id: &TenantId, to: TenantStatus) -> Result<Tenant, DocflowError> {
        let mut tenant = self.control.tenant(id).await?;
        let from = tenant.status;
        tenant.transition(to, self.clock.now())?;
        self.control.update_tenant(&tenant).await?;
        info!(tenant_id = %id, from = %from, to = %to, "Tenant status changed");
        Ok(tenant)
    }

    /// Builds a fresh binding for a tenant from its durable id.
    ///
    /// # Errors
    ///
    /// [`DocflowError::TenantUnavailable`] if the tenant is unknown or not
    /// active.
    pub async fn context_for(&self, id: &TenantId) -> Result<TenantContext, DocflowError> {
        let tenant = match self.control.tenant(id).await {
            Ok(tenant) => tenant,
            Err(StorageError::NotFound { .. }) => {
                return Err(DocflowError::tenant_unavailable(id.as_str(), "unknown tenant"));
            }
            Err(err) => return Err(err.into()),
        };
        if !tenant.is_active() {
            return Err(DocflowError::tenant_unavailable(
                id.as_str(),
                format!("tenant is {}", tenant.status),
            ));
        }
        let store = self.factory.open(&tenant)?;
        let ctx = TenantContext::new(tenant, store);
        debug!(tenant_id = %id, connection_id = %ctx.connection_id(), "Tenant context acquired");
        Ok(ctx)
    }

    /// Runs `fut` bound to the tenant identified by `id`.
    pub async fn run<F, T>(&self, id: &TenantId, fut: F) -> Result<T, DocflowError>
    where
        F: Future<Output = Result<T, DocflowError>>,
    {
        let ctx = self.context_for(id).await?;
        let connection_id = ctx.connection_id();
        let result = TenantContext::run(ctx, fut).await;
        debug!(tenant_id = %id, connection_id = %connection_id, "Tenant context released");
        result
    }
}
