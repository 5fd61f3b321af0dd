//! Tenant records and their lifecycle.

use crate::errors::TransitionError;
use crate::state::{check_transition, Lifecycle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable tenant identifier.
///
/// Persisted on every job so any worker can re-establish the tenant binding
/// without in-memory state from the worker that created the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Storage is being prepared.
    Provisioning,
    /// Accepting work.
    Active,
    /// Temporarily refusing work.
    Suspended,
    /// Retired for good.
    Archived,
}

impl Lifecycle for TenantStatus {
    const ENTITY: &'static str = "tenant";

    fn all() -> &'static [Self] {
        &[Self::Provisioning, Self::Active, Self::Suspended, Self::Archived]
    }

    fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Provisioning => &[Self::Active, Self::Archived],
            Self::Active => &[Self::Suspended, Self::Archived],
            Self::Suspended => &[Self::Active, Self::Archived],
            Self::Archived => &[],
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// An isolated tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant id.
    pub id: TenantId,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: TenantStatus,
    /// Locator of the tenant's isolated store.
    pub storage_locator: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Creates a tenant in `Provisioning`.
    #[must_use]
    pub fn new(
        id: TenantId,
        name: impl Into<String>,
        storage_locator: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            status: TenantStatus::Provisioning,
            storage_locator: storage_locator.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the tenant to `to`.
    pub fn transition(&mut self, to: TenantStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        check_transition(self.status, to)?;
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Returns true if work may be bound to this tenant.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}
