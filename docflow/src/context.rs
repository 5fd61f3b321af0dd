//! The context handed to a stage capability.

use crate::pipeline::StageConfig;
use crate::state::Document;
use crate::storage::TenantStore;
use crate::tenant::{TenantContext, TenantId};
use std::sync::Arc;
use uuid::Uuid;

/// Everything a capability may look at while executing one stage.
///
/// Built by the engines from the job's frozen pipeline and the stage
/// executions recorded so far.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The document being processed.
    pub document: Arc<Document>,
    /// The stage's frozen configuration.
    pub stage: StageConfig,
    /// The job running the stage.
    pub job_id: Uuid,
    /// Attempt number of this stage within the job (1-based).
    pub attempt: u32,
    /// Outputs of completed stages, keyed by stage id.
    pub prior_outputs: serde_json::Map<String, serde_json::Value>,
    /// The tenant binding the stage runs under.
    pub tenant: TenantContext,
}

impl StageContext {
    /// Creates a stage context.
    #[must_use]
    pub fn new(
        document: Arc<Document>,
        stage: StageConfig,
        job_id: Uuid,
        attempt: u32,
        prior_outputs: serde_json::Map<String, serde_json::Value>,
        tenant: TenantContext,
    ) -> Self {
        Self {
            document,
            stage,
            job_id,
            attempt,
            prior_outputs,
            tenant,
        }
    }

    /// The stage id.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage.id
    }

    /// A stage config value.
    #[must_use]
    pub fn config(&self, key: &str) -> Option<&serde_json::Value> {
        self.stage.config.get(key)
    }

    /// A config value as a string.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config(key).and_then(serde_json::Value::as_str)
    }

    /// The output of a prior stage.
    #[must_use]
    pub fn prior_output(&self, stage_id: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.prior_outputs.get(stage_id).and_then(serde_json::Value::as_object)
    }

    /// A single value from a prior stage's output.
    #[must_use]
    pub fn prior_value(&self, stage_id: &str, key: &str) -> Option<&serde_json::Value> {
        self.prior_output(stage_id).and_then(|output| output.get(key))
    }

    /// The input snapshot recorded on the stage execution row.
    #[must_use]
    pub fn input_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Object(self.prior_outputs.clone())
    }

    /// The tenant id.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        self.tenant.tenant_id()
    }

    /// The tenant's isolated store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn TenantStore> {
        self.tenant.store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTenantStore;
    use crate::tenant::Tenant;
    use crate::testing::new_document;
    use chrono::Utc;
    use serde_json::json;

    fn context() -> StageContext {
        let tenant_id = TenantId::new("acme");
        let tenant = Tenant::new(tenant_id.clone(), "Acme", "mem://acme", Utc::now());
        let binding = TenantContext::new(tenant, Arc::new(InMemoryTenantStore::new(tenant_id.clone())));
        let document = Document::new(Uuid::new_v4(), tenant_id, new_document(Uuid::new_v4(), "abc"), Utc::now());
        let stage = StageConfig::new("validate", "validator").with_config("schema", json!("invoice-v2"));

        let mut prior = serde_json::Map::new();
        prior.insert("extract".to_string(), json!({"pages": 3}));
        StageContext::new(Arc::new(document), stage, Uuid::new_v4(), 2, prior, binding)
    }

    #[test]
    fn test_reads_config_and_prior_outputs() {
        let ctx = context();
        assert_eq!(ctx.stage_id(), "validate");
        assert_eq!(ctx.config_str("schema"), Some("invoice-v2"));
        assert_eq!(ctx.prior_value("extract", "pages"), Some(&json!(3)));
        assert!(ctx.prior_output("classify").is_none());
        assert_eq!(ctx.tenant_id().to_string(), "acme");
    }

    #[test]
    fn test_input_snapshot_mirrors_prior_outputs() {
        assert_eq!(context().input_snapshot(), json!({"extract": {"pages": 3}}));
    }
}
