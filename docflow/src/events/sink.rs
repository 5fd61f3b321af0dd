//! Event sink trait and implementations.

use crate::core::{EventType, LifecycleEvent};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, Level};

/// Receives lifecycle events from the engines.
///
/// Sinks are called while the emitting unit of work is still bound to its
/// tenant, so a sink may read or write tenant-scoped storage.
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    /// Emits an event.
    ///
    /// Implementations must not fail the caller; problems are logged and
    /// swallowed.
    async fn emit(&self, event: &LifecycleEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &LifecycleEvent) {}
}

/// A sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &LifecycleEvent) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.kind,
                tenant_id = %event.tenant_id,
                job_id = %event.job_id,
                document_id = %event.document_id,
                event_data = ?event.data,
                "Event: {}", event.kind
            );
        } else {
            info!(
                event_type = %event.kind,
                tenant_id = %event.tenant_id,
                job_id = %event.job_id,
                document_id = %event.document_id,
                event_data = ?event.data,
                "Event: {}", event.kind
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &LifecycleEvent) {
        self.log_event(event);
    }
}

/// Forwards every event to several sinks in order.
#[derive(Debug, Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of downstream sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if no sinks were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event).await;
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Returns the events of one kind.
    #[must_use]
    pub fn events_of(&self, kind: EventType) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    /// Counts the events of one kind.
    #[must_use]
    pub fn count(&self, kind: EventType) -> usize {
        self.events.read().iter().filter(|event| event.kind == kind).count()
    }

    /// Returns the event kinds in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventType> {
        self.events.read().iter().map(|event| event.kind).collect()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &LifecycleEvent) {
        self.events.write().push(event.clone());
    }
}
