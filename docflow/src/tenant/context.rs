//! Task-scoped tenant binding.
//!
//! A [`TenantContext`] is bound to the current tokio task with
//! [`TenantContext::run`]. Nested calls read it back with
//! [`TenantContext::current`] or [`TenantContext::require`] instead of
//! threading it through every signature. The binding is task-local: spawned
//! tasks start unbound and concurrent workers never observe each other's
//! tenant.

use super::{Tenant, TenantId};
use crate::errors::DocflowError;
use crate::storage::TenantStore;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// The active binding of a unit of work to one tenant's storage.
#[derive(Clone)]
pub struct TenantContext {
    tenant: Arc<Tenant>,
    store: Arc<dyn TenantStore>,
    connection_id: Uuid,
}

impl fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("tenant_id", &self.tenant.id)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl TenantContext {
    /// Creates a binding for `tenant` over an opened store.
    #[must_use]
    pub fn new(tenant: Tenant, store: Arc<dyn TenantStore>) -> Self {
        Self {
            tenant: Arc::new(tenant),
            store,
            connection_id: crate::utils::generate_id(),
        }
    }

    /// Runs `fut` with `ctx` bound as the current tenant.
    ///
    /// The previous binding (or none) is restored when `fut` completes, is
    /// dropped, or panics.
    pub async fn run<F>(ctx: Self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TENANT.scope(ctx, fut).await
    }

    /// Runs a synchronous closure with `ctx` bound.
    pub fn run_sync<R>(ctx: Self, f: impl FnOnce() -> R) -> R {
        CURRENT_TENANT.sync_scope(ctx, f)
    }

    /// Returns the binding of the current task, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_TENANT.try_with(Clone::clone).ok()
    }

    /// Returns the binding of the current task.
    ///
    /// # Errors
    ///
    /// Fails with [`DocflowError::TenantContextMissing`] outside of any
    /// [`TenantContext::run`].
    pub fn require() -> Result<Self, DocflowError> {
        Self::current().ok_or(DocflowError::TenantContextMissing)
    }

    /// Returns the tenant-scoped store of the current binding.
    ///
    /// # Errors
    ///
    /// Fails with [`DocflowError::TenantContextMissing`] when unbound.
    pub fn scoped_store() -> Result<Arc<dyn TenantStore>, DocflowError> {
        Ok(Self::require()?.store())
    }

    /// The bound tenant.
    #[must_use]
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    /// The bound tenant id.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant.id
    }

    /// The tenant's isolated store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn TenantStore> {
        Arc::clone(&self.store)
    }

    /// Identifier of this binding's connection.
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}
