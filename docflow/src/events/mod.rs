//! Lifecycle event emission.
//!
//! Both engines report state changes as [`LifecycleEvent`](crate::core::LifecycleEvent)s
//! through an [`EventSink`]. Sinks compose with [`FanoutEventSink`]; the
//! notification subsystem plugs in as one more sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, FanoutEventSink, LoggingEventSink, NoOpEventSink};
