//! Span attributes for job dispatches and stage invocations.
//!
//! Both attribute sets render to flat `key -> value` maps for exporters
//! and open the `tracing` spans the engines run under.

use crate::pipeline::EngineKind;
use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Span attributes for one dispatch of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpanAttributes {
    /// Engine handling the dispatch.
    pub engine: EngineKind,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Job (or workflow) id.
    pub job_id: Uuid,
    /// Document processed by the job.
    pub document_id: Option<Uuid>,
    /// Campaign the document belongs to.
    pub campaign_id: Option<Uuid>,
    /// Stage cursor at dispatch time.
    pub stage_id: Option<String>,
}

impl JobSpanAttributes {
    /// Creates attributes for a dispatch.
    #[must_use]
    pub fn new(engine: EngineKind, tenant_id: &TenantId, job_id: Uuid) -> Self {
        Self {
            engine,
            tenant_id: tenant_id.clone(),
            job_id,
            document_id: None,
            campaign_id: None,
            stage_id: None,
        }
    }

    /// Sets the document id.
    #[must_use]
    pub fn with_document(mut self, document_id: Uuid) -> Self {
        self.document_id = Some(document_id);
        self
    }

    /// Sets the campaign id.
    #[must_use]
    pub fn with_campaign(mut self, campaign_id: Uuid) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    /// Sets the current stage.
    #[must_use]
    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    /// Converts to exporter attributes.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();

        attrs.insert("docflow.engine".to_string(), self.engine.to_string());
        attrs.insert("docflow.tenant_id".to_string(), self.tenant_id.to_string());
        attrs.insert("docflow.job_id".to_string(), self.job_id.to_string());

        if let Some(v) = self.document_id {
            attrs.insert("docflow.document_id".to_string(), v.to_string());
        }
        if let Some(v) = self.campaign_id {
            attrs.insert("docflow.campaign_id".to_string(), v.to_string());
        }
        if let Some(ref v) = self.stage_id {
            attrs.insert("docflow.stage_id".to_string(), v.clone());
        }

        attrs
    }

    /// Opens the `dispatch` span.
    #[must_use]
    pub fn span(&self) -> Span {
        info_span!(
            "dispatch",
            engine = %self.engine,
            tenant_id = %self.tenant_id,
            job_id = %self.job_id,
        )
    }
}

/// Span attributes for one stage attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage id.
    pub stage_id: String,
    /// Capability invoked.
    pub capability: Option<String>,
    /// Attempt number.
    pub attempt: Option<u32>,
    /// Final status.
    pub status: Option<String>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Error message if failed.
    pub error: Option<String>,
}

impl StageSpanAttributes {
    /// Creates stage span attributes.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            ..Default::default()
        }
    }

    /// Sets the capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Sets the attempt.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Sets the stage status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Converts to exporter attributes.
    #[must_use]
    pub fn to_otel_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();

        attrs.insert("stage.id".to_string(), self.stage_id.clone());

        if let Some(ref v) = self.capability {
            attrs.insert("stage.capability".to_string(), v.clone());
        }
        if let Some(v) = self.attempt {
            attrs.insert("stage.attempt".to_string(), v.to_string());
        }
        if let Some(ref v) = self.status {
            attrs.insert("stage.status".to_string(), v.clone());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("stage.duration_ms".to_string(), v.to_string());
        }
        if let Some(ref v) = self.error {
            attrs.insert("stage.error".to_string(), v.clone());
        }

        attrs
    }

    /// Opens the `stage` span.
    #[must_use]
    pub fn span(&self) -> Span {
        info_span!(
            "stage",
            stage_id = %self.stage_id,
            capability = self.capability.as_deref().unwrap_or_default(),
            attempt = self.attempt.unwrap_or_default(),
        )
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}
