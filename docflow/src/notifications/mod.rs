//! Outbound notifications.
//!
//! Lifecycle events a campaign subscribed to are POSTed to its endpoint as
//! JSON, signed with HMAC-SHA256 over the exact body bytes. Failed attempts
//! are retried on a fixed backoff schedule through the dispatch queue, and
//! every attempt is recorded as a [`DeliveryRecord`].

mod delivery;
mod service;
pub mod signing;
mod transport;

pub use delivery::{DeliveryRecord, DeliveryStatus};
pub use service::{NotificationEventSink, NotificationService};
pub use signing::{sign_payload, verify_signature};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{TransportError, WebhookRequest, WebhookResponse, WebhookTransport};
