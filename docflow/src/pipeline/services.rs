//! Collaborators shared by the engines, the intake and the worker.

use super::{DispatchGuard, JobQueue};
use crate::core::{EventType, LifecycleEvent};
use crate::events::EventSink;
use crate::stages::CapabilityRegistry;
use crate::storage::ControlStore;
use crate::state::Job;
use crate::tenant::TenantManager;
use crate::utils::Clock;
use std::sync::Arc;

/// Handles to everything an engine needs besides its own configuration.
///
/// Cloning is cheap; every field is shared.
#[derive(Debug, Clone)]
pub struct EngineServices {
    /// Tenant registry and binder.
    pub tenants: TenantManager,
    /// Signal waits and the received-signal log.
    pub control: Arc<dyn ControlStore>,
    /// Stage capabilities.
    pub registry: Arc<CapabilityRegistry>,
    /// Background dispatch queue.
    pub queue: Arc<dyn JobQueue>,
    /// At-most-one-dispatch-per-job guard.
    pub guard: DispatchGuard,
    /// Lifecycle event sink.
    pub events: Arc<dyn EventSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl EngineServices {
    /// Emits a lifecycle event about `job`, stamped with the current time.
    pub async fn emit(&self, kind: EventType, job: &Job, data: serde_json::Value) {
        let mut event = LifecycleEvent::for_job(kind, job, self.clock.now());
        if let serde_json::Value::Object(map) = data {
            event.data = map;
        }
        self.events.emit(&event).await;
    }
}
