//! Observability utilities.

mod subscriber;
mod tracing;

pub use self::tracing::{JobSpanAttributes, SpanTimer, StageSpanAttributes};
pub use subscriber::init_tracing;
