//! Campaigns: the owner of a pipeline definition and notification settings.

use crate::core::EventType;
use crate::pipeline::{EngineKind, PipelineDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where and how a campaign is notified of lifecycle events.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Endpoint URL; `None` disables notifications.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Shared secret used to sign payloads.
    #[serde(default)]
    pub secret: String,
    /// Event types the campaign subscribed to.
    #[serde(default)]
    pub enabled_events: Vec<EventType>,
}

impl fmt::Debug for NotificationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSettings")
            .field("endpoint", &self.endpoint)
            .field("secret", &"<redacted>")
            .field("enabled_events", &self.enabled_events)
            .finish()
    }
}

impl NotificationSettings {
    /// Creates settings for an endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            secret: secret.into(),
            enabled_events: Vec::new(),
        }
    }

    /// Subscribes to an event type.
    #[must_use]
    pub fn with_event(mut self, kind: EventType) -> Self {
        if !self.enabled_events.contains(&kind) {
            self.enabled_events.push(kind);
        }
        self
    }

    /// Returns true if `kind` should be delivered.
    #[must_use]
    pub fn is_enabled(&self, kind: EventType) -> bool {
        self.endpoint.as_deref().is_some_and(|e| !e.is_empty()) && self.enabled_events.contains(&kind)
    }
}

/// A campaign: documents uploaded to it are processed by its pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Campaign id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Engine driving the campaign's jobs.
    #[serde(default)]
    pub engine: EngineKind,
    /// Stage list; frozen into each job.
    pub pipeline: PipelineDefinition,
    /// Job-level attempts per stage.
    pub max_attempts: u32,
    /// Outbound notifications.
    #[serde(default)]
    pub notifications: NotificationSettings,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    /// Creates a baseline-engine campaign with three attempts per stage.
    #[must_use]
    pub fn new(id: Uuid, name: impl Into<String>, pipeline: PipelineDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            engine: EngineKind::Pipeline,
            pipeline,
            max_attempts: 3,
            notifications: NotificationSettings::default(),
            created_at: now,
        }
    }

    /// Sets the engine.
    #[must_use]
    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the job-level attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the notification settings.
    #[must_use]
    pub fn with_notifications(mut self, notifications: NotificationSettings) -> Self {
        self.notifications = notifications;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_disabled_without_endpoint() {
        let settings = NotificationSettings {
            endpoint: None,
            secret: "s".into(),
            enabled_events: vec![EventType::DocumentCompleted],
        };
        assert!(!settings.is_enabled(EventType::DocumentCompleted));
    }

    #[test]
    fn test_notifications_respect_enabled_events() {
        let settings = NotificationSettings::new("https://hooks.example.com", "s")
            .with_event(EventType::DocumentCompleted)
            .with_event(EventType::DocumentCompleted);
        assert_eq!(settings.enabled_events.len(), 1);
        assert!(settings.is_enabled(EventType::DocumentCompleted));
        assert!(!settings.is_enabled(EventType::DocumentFailed));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let settings = NotificationSettings::new("https://hooks.example.com", "topsecret");
        assert!(!format!("{settings:?}").contains("topsecret"));
    }
}
