//! Delivery records: one append-only row per attempt.

use crate::core::EventType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// The endpoint answered 2xx.
    Delivered,
    /// The attempt failed and another one is scheduled.
    Failed,
    /// The attempt failed and no attempts remain.
    PermanentlyFailed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::PermanentlyFailed => write!(f, "permanently_failed"),
        }
    }
}

/// One delivery attempt.
///
/// Every attempt of the same notification shares `delivery_id`, which is
/// also sent to the endpoint so it can drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Row id.
    pub id: Uuid,
    /// Stable id shared by all attempts.
    pub delivery_id: Uuid,
    /// Campaign notified.
    pub campaign_id: Uuid,
    /// Event delivered.
    pub event: EventType,
    /// Endpoint the attempt targeted.
    pub endpoint: String,
    /// Attempt number (1-based).
    pub attempt: u32,
    /// Outcome.
    pub status: DeliveryStatus,
    /// HTTP status, when the endpoint answered.
    pub response_status: Option<u16>,
    /// Failure reason.
    pub error: Option<String>,
    /// Signed JSON body.
    pub payload: serde_json::Value,
    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
    /// When the next attempt is due, for failed attempts with retries left.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    /// Returns true if the endpoint accepted the notification.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}
