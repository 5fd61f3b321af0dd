//! In-memory control store.

use super::{ControlStore, StorageResult};
use crate::errors::StorageError;
use crate::tenant::{Tenant, TenantId};
use crate::workflow::{ReceivedSignal, SignalWait};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct LeaseRecord {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Tenant registry, signal waits, the signal log and dispatch leases, held
/// in memory.
#[derive(Debug, Default)]
pub struct InMemoryControlStore {
    tenants: DashMap<TenantId, Tenant>,
    waits: DashMap<String, SignalWait>,
    signals: DashMap<String, ReceivedSignal>,
    leases: DashMap<String, LeaseRecord>,
}

impl InMemoryControlStore {
    /// Creates an empty control store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered waits.
    #[must_use]
    pub fn wait_count(&self) -> usize {
        self.waits.len()
    }
}

#[async_trait]
impl ControlStore for InMemoryControlStore {
    async fn insert_tenant(&self, tenant: Tenant) -> StorageResult<()> {
        match self.tenants.entry(tenant.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::conflict("tenant", &tenant.id)),
            Entry::Vacant(slot) => {
                slot.insert(tenant);
                Ok(())
            }
        }
    }

    async fn tenant(&self, id: &TenantId) -> StorageResult<Tenant> {
        self.tenants
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| StorageError::not_found("tenant", id))
    }

    async fn update_tenant(&self, tenant: &Tenant) -> StorageResult<()> {
        let mut slot = self
            .tenants
            .get_mut(&tenant.id)
            .ok_or_else(|| StorageError::not_found("tenant", &tenant.id))?;
        *slot = tenant.clone();
        Ok(())
    }

    async fn tenants(&self) -> StorageResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.tenants.iter().map(|t| t.clone()).collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn register_wait(&self, wait: SignalWait) -> StorageResult<()> {
        match self.waits.entry(wait.correlation_id.clone()) {
            Entry::Occupied(_) => Err(StorageError::conflict("signal_wait", &wait.correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(wait);
                Ok(())
            }
        }
    }

    async fn wait(&self, correlation_id: &str) -> StorageResult<Option<SignalWait>> {
        Ok(self.waits.get(correlation_id).map(|w| w.clone()))
    }

    async fn take_wait(&self, correlation_id: &str) -> StorageResult<Option<SignalWait>> {
        Ok(self.waits.remove(correlation_id).map(|(_, wait)| wait))
    }

    async fn remove_waits_for_workflow(&self, workflow_id: Uuid) -> StorageResult<Vec<SignalWait>> {
        let keys: Vec<String> = self
            .waits
            .iter()
            .filter(|w| w.workflow_id == workflow_id)
            .map(|w| w.key().clone())
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|key| self.waits.remove(&key).map(|(_, wait)| wait))
            .collect())
    }

    async fn expired_waits(&self, now: DateTime<Utc>) -> StorageResult<Vec<SignalWait>> {
        let mut expired: Vec<SignalWait> = self
            .waits
            .iter()
            .filter(|w| w.deadline <= now)
            .map(|w| w.clone())
            .collect();
        expired.sort_by_key(|w| w.deadline);
        Ok(expired)
    }

    async fn record_signal(&self, signal: ReceivedSignal) -> StorageResult<bool> {
        match self.signals.entry(signal.correlation_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(signal);
                Ok(true)
            }
        }
    }

    async fn signal(&self, correlation_id: &str) -> StorageResult<Option<ReceivedSignal>> {
        Ok(self.signals.get(correlation_id).map(|s| s.clone()))
    }

    async fn mark_signal_consumed(&self, correlation_id: &str, workflow_id: Uuid) -> StorageResult<()> {
        let mut signal = self
            .signals
            .get_mut(correlation_id)
            .ok_or_else(|| StorageError::not_found("signal", correlation_id))?;
        signal.consumed_by = Some(workflow_id);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        key: &str,
        token: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let record = LeaseRecord { token, expires_at };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let held = slot.get();
                if held.token != token && held.expires_at > now {
                    return Ok(false);
                }
                slot.insert(record);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    async fn renew_lease(&self, key: &str, token: Uuid, expires_at: DateTime<Utc>) -> StorageResult<bool> {
        match self.leases.get_mut(key) {
            Some(mut held) if held.token == token => {
                held.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, token: Uuid) -> StorageResult<()> {
        self.leases.remove_if(key, |_, held| held.token == token);
        Ok(())
    }

    async fn lease_expiry(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.leases.get(key).map(|held| held.expires_at))
    }
}
