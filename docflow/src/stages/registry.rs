//! Capability registry.
//!
//! Capabilities are registered by id at bootstrap, then the registry is
//! sealed and shared read-only between workers.

use super::StageCapability;
use crate::errors::{DependencyViolationError, DocflowError, ErrorInfo, PipelineValidationError};
use crate::pipeline::{PipelineDefinition, StageConfig};
use crate::state::{Job, StageExecution, StageExecutionState};
use crate::tenant::TenantContext;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maps capability ids to implementations.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, Arc<dyn StageCapability>>>,
    sealed: AtomicBool,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under `id`.
    ///
    /// # Errors
    ///
    /// [`DocflowError::Registry`] if the id is blank or taken, the
    /// descriptor declares a blank config key, or the registry is sealed.
    pub fn register(&self, id: impl Into<String>, capability: Arc<dyn StageCapability>) -> Result<(), DocflowError> {
        let id = id.into();
        if self.sealed.load(Ordering::Acquire) {
            return Err(DocflowError::Registry(format!(
                "cannot register '{id}': registry is sealed"
            )));
        }
        if id.trim().is_empty() || id.chars().any(char::is_whitespace) {
            return Err(DocflowError::Registry(format!("invalid capability id '{id}'")));
        }
        if capability
            .descriptor()
            .required_config
            .iter()
            .any(|key| key.trim().is_empty())
        {
            return Err(DocflowError::Registry(format!(
                "capability '{id}' declares a blank required config key"
            )));
        }

        let mut capabilities = self.capabilities.write();
        if capabilities.contains_key(&id) {
            return Err(DocflowError::Registry(format!("capability '{id}' is already registered")));
        }
        tracing::debug!(capability = %id, implementation = capability.name(), "Capability registered");
        capabilities.insert(id, capability);
        Ok(())
    }

    /// Freezes the registry; later registrations fail.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Returns true once sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Looks up a capability.
    ///
    /// # Errors
    ///
    /// [`DocflowError::CapabilityNotFound`] if unregistered.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn StageCapability>, DocflowError> {
        self.capabilities
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DocflowError::capability_not_found(id))
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.capabilities.read().contains_key(id)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.capabilities.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.read().is_empty()
    }

    /// Checks that every prerequisite of `stage_id` has a completed execution
    /// in `job`, reading the executions from the bound tenant's store.
    ///
    /// # Errors
    ///
    /// [`DocflowError::DependencyViolation`] listing the missing stages,
    /// [`DocflowError::TenantContextMissing`] when called unbound.
    pub async fn assert_dependencies_satisfied(&self, stage_id: &str, job: &Job) -> Result<(), DocflowError> {
        let stage = job.pipeline.stage(stage_id).ok_or_else(|| {
            DocflowError::Internal(format!("stage '{stage_id}' is not part of job {}", job.id))
        })?;
        let executions = TenantContext::scoped_store()?.executions_for_job(job.id).await?;
        check_dependencies(stage, &executions)?;
        Ok(())
    }

    /// Validates a definition against the registered capabilities.
    ///
    /// Runs [`PipelineDefinition::validate`] first, then checks every stage
    /// references a registered capability with its required config keys set.
    ///
    /// # Errors
    ///
    /// [`DocflowError::Validation`] or [`DocflowError::CapabilityNotFound`].
    pub fn validate_pipeline(&self, definition: &PipelineDefinition) -> Result<(), DocflowError> {
        definition.validate()?;
        for stage in &definition.stages {
            let capability = self.resolve(&stage.capability)?;
            let missing: Vec<String> = capability
                .descriptor()
                .required_config
                .into_iter()
                .filter(|key| !stage.config.contains_key(key))
                .collect();
            if !missing.is_empty() {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' is missing required config: {}",
                    stage.id,
                    missing.join(", ")
                ))
                .with_stages(vec![stage.id.clone()])
                .with_error_info(
                    ErrorInfo::new("PIPELINE-CONFIG", "Required capability config missing")
                        .with_context_entry("capability", &stage.capability),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Checks `stage`'s dependencies against a job's recorded executions.
///
/// # Errors
///
/// [`DependencyViolationError`] listing prerequisites with no completed row.
pub fn check_dependencies(stage: &StageConfig, executions: &[StageExecution]) -> Result<(), DependencyViolationError> {
    let missing: Vec<String> = stage
        .dependencies
        .iter()
        .filter(|dep| {
            !executions
                .iter()
                .any(|row| &row.stage_id == *dep && row.state == StageExecutionState::Completed)
        })
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DependencyViolationError::new(stage.id.clone(), missing))
    }
}
