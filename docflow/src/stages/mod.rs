//! Stage capabilities.
//!
//! A capability is the pluggable implementation behind a stage id in a
//! campaign pipeline (extraction, classification, verification...). The
//! engines only ever see the [`StageCapability`] trait.

mod registry;

pub use registry::{check_dependencies, CapabilityRegistry};

use crate::context::StageContext;
use crate::core::StageOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Static facts a capability declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Config keys a stage must set to use the capability.
    #[serde(default)]
    pub required_config: Vec<String>,
    /// Whether the capability may return `AwaitingSignal`. The workflow
    /// engine fails a stage that asks to wait without declaring this.
    #[serde(default)]
    pub supports_suspension: bool,
}

impl CapabilityDescriptor {
    /// Requires a config key.
    #[must_use]
    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.required_config.push(key.into());
        self
    }

    /// Marks the capability as able to suspend.
    #[must_use]
    pub fn suspending(mut self) -> Self {
        self.supports_suspension = true;
        self
    }
}

/// The contract every stage implementation satisfies.
///
/// Given the document, its stage config, prior outputs and the tenant
/// binding, a capability returns success or failure with an output payload,
/// artifacts and resource counters, or asks to suspend until a signal with
/// a correlation id arrives.
#[async_trait]
pub trait StageCapability: Send + Sync + Debug {
    /// Capability name, for logs.
    fn name(&self) -> &str;

    /// Declared requirements.
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::default()
    }

    /// Executes one stage invocation.
    async fn execute(&self, ctx: &StageContext) -> StageOutcome;
}

/// A capability backed by a synchronous closure.
pub struct FnCapability<F>
where
    F: Fn(&StageContext) -> StageOutcome + Send + Sync,
{
    name: String,
    descriptor: CapabilityDescriptor,
    func: F,
}

impl<F> FnCapability<F>
where
    F: Fn(&StageContext) -> StageOutcome + Send + Sync,
{
    /// Creates a closure-backed capability.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            descriptor: CapabilityDescriptor::default(),
            func,
        }
    }

    /// Sets the descriptor.
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: CapabilityDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }
}

impl<F> Debug for FnCapability<F>
where
    F: Fn(&StageContext) -> StageOutcome + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCapability")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> StageCapability for FnCapability<F>
where
    F: Fn(&StageContext) -> StageOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutcome {
        (self.func)(ctx)
    }
}
