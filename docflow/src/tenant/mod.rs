//! Tenant isolation.
//!
//! Every read or write of tenant data goes through a [`TenantContext`]
//! bound with [`TenantContext::run`] (usually via [`TenantManager::run`],
//! which re-establishes the binding from a durable [`TenantId`]).

mod context;
mod manager;
mod model;

pub use context::TenantContext;
pub use manager::TenantManager;
pub use model::{Tenant, TenantId, TenantStatus};
