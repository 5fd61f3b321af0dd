//! Signed, retried delivery of lifecycle events to campaign endpoints.

use super::delivery::{DeliveryRecord, DeliveryStatus};
use super::signing::{sign_payload, ATTEMPT_HEADER, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use super::transport::{WebhookRequest, WebhookTransport};
use crate::campaign::Campaign;
use crate::config::NotificationConfig;
use crate::core::{EventType, LifecycleEvent};
use crate::errors::{DeliveryFailure, DocflowError};
use crate::events::EventSink;
use crate::pipeline::{DispatchMessage, JobQueue};
use crate::tenant::{TenantContext, TenantId, TenantManager};
use crate::utils::{generate_id, to_chrono, Clock};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delivers lifecycle events to campaign webhooks.
///
/// Each attempt is recorded in the tenant's store. Failed attempts are
/// retried through the dispatch queue, so no attempt ever sleeps in-process.
/// Delivery outcomes never affect document processing.
#[derive(Clone)]
pub struct NotificationService {
    transport: Arc<dyn WebhookTransport>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    tenants: TenantManager,
    config: NotificationConfig,
}

impl fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NotificationService {
    /// Creates a service.
    #[must_use]
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        tenants: TenantManager,
        config: NotificationConfig,
    ) -> Self {
        Self {
            transport,
            queue,
            clock,
            tenants,
            config,
        }
    }

    /// Makes the first delivery attempt for `event`.
    ///
    /// Returns `None` without contacting anything when the campaign has no
    /// endpoint or did not enable the event type. Must run bound to the
    /// campaign's tenant.
    ///
    /// # Errors
    ///
    /// Tenant binding, storage or queue failures. An endpoint failure is not
    /// an error; it is recorded and retried.
    pub async fn notify(
        &self,
        campaign: &Campaign,
        event: &LifecycleEvent,
    ) -> Result<Option<DeliveryRecord>, DocflowError> {
        if !campaign.notifications.is_enabled(event.kind) {
            debug!(campaign_id = %campaign.id, event_type = %event.kind, "Event not enabled; skipping");
            return Ok(None);
        }
        let tenant_id = TenantContext::require()?.tenant_id().clone();
        let delivery_id = generate_id();
        let mut payload = event.to_payload();
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("delivery_id".to_string(), serde_json::json!(delivery_id));
        }
        self.attempt(&tenant_id, campaign, delivery_id, event.kind, payload, 1)
            .await
            .map(Some)
    }

    /// Makes attempt number `attempt` of an earlier delivery.
    ///
    /// Replayed messages are dropped: nothing is sent once the delivery
    /// succeeded or once `attempt` has already been recorded.
    ///
    /// # Errors
    ///
    /// Unknown delivery id, or tenant and storage failures.
    pub async fn retry(
        &self,
        tenant_id: &TenantId,
        delivery_id: Uuid,
        attempt: u32,
    ) -> Result<Option<DeliveryRecord>, DocflowError> {
        self.tenants
            .run(tenant_id, async {
                let store = TenantContext::scoped_store()?;
                let attempts = store.delivery_attempts(delivery_id).await?;
                let Some(last) = attempts.last() else {
                    return Err(DocflowError::Internal(format!("unknown delivery {delivery_id}")));
                };
                if attempts.iter().any(|r| r.is_delivered() || r.attempt >= attempt) {
                    debug!(delivery_id = %delivery_id, attempt, "Delivery attempt already made; skipping");
                    return Ok(None);
                }
                let campaign = store.campaign(last.campaign_id).await?;
                self.attempt(tenant_id, &campaign, delivery_id, last.event, last.payload.clone(), attempt)
                    .await
                    .map(Some)
            })
            .await
    }

    async fn attempt(
        &self,
        tenant_id: &TenantId,
        campaign: &Campaign,
        delivery_id: Uuid,
        event: EventType,
        payload: serde_json::Value,
        attempt: u32,
    ) -> Result<DeliveryRecord, DocflowError> {
        let store = TenantContext::scoped_store()?;
        let settings = &campaign.notifications;
        let endpoint = settings.endpoint.clone().unwrap_or_default();
        let body = serde_json::to_vec(&payload)?;

        let (response_status, failure) = if endpoint.is_empty() {
            (None, Some("no endpoint configured".to_string()))
        } else {
            let request = WebhookRequest {
                url: endpoint.clone(),
                headers: vec![
                    (SIGNATURE_HEADER.to_string(), sign_payload(&settings.secret, &body)),
                    (EVENT_HEADER.to_string(), event.as_str().to_string()),
                    (DELIVERY_HEADER.to_string(), delivery_id.to_string()),
                    (ATTEMPT_HEADER.to_string(), attempt.to_string()),
                ],
                body,
            };
            match self.transport.send(&request).await {
                Ok(response) if response.is_success() => (Some(response.status), None),
                Ok(response) => (Some(response.status), Some(format!("endpoint answered {}", response.status))),
                Err(err) => (None, Some(err.to_string())),
            }
        };

        let now = self.clock.now();
        let mut record = DeliveryRecord {
            id: generate_id(),
            delivery_id,
            campaign_id: campaign.id,
            event,
            endpoint,
            attempt,
            status: DeliveryStatus::Delivered,
            response_status,
            error: None,
            payload,
            attempted_at: now,
            next_attempt_at: None,
        };

        match failure {
            None => {
                info!(
                    tenant_id = %tenant_id,
                    delivery_id = %delivery_id,
                    event_type = %event,
                    attempt,
                    status = ?response_status,
                    "Notification delivered"
                );
            }
            Some(reason) => {
                let failure = DeliveryFailure {
                    delivery_id,
                    attempt,
                    status: response_status,
                    reason: reason.clone(),
                };
                record.error = Some(reason);
                if attempt < self.config.max_attempts {
                    let delay = self.config.backoff.delay_for(attempt);
                    record.status = DeliveryStatus::Failed;
                    record.next_attempt_at = Some(now + to_chrono(delay));
                    self.queue
                        .enqueue(
                            DispatchMessage::NotificationRetry {
                                tenant_id: tenant_id.clone(),
                                delivery_id,
                                attempt: attempt + 1,
                            },
                            delay,
                        )
                        .await?;
                    warn!(%failure, delay_secs = delay.as_secs(), "Notification retry scheduled");
                } else {
                    record.status = DeliveryStatus::PermanentlyFailed;
                    error!(%failure, max_attempts = self.config.max_attempts, "Notification permanently failed");
                }
            }
        }

        store.append_delivery(record.clone()).await?;
        Ok(record)
    }
}

/// [`EventSink`] that forwards lifecycle events to [`NotificationService`].
///
/// Looks the campaign up in the bound tenant's store. Failures are logged
/// and never reach the emitting engine.
#[derive(Debug, Clone)]
pub struct NotificationEventSink {
    service: Arc<NotificationService>,
}

impl NotificationEventSink {
    /// Wraps a service.
    #[must_use]
    pub fn new(service: Arc<NotificationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventSink for NotificationEventSink {
    async fn emit(&self, event: &LifecycleEvent) {
        let campaign = match TenantContext::scoped_store() {
            Ok(store) => store.campaign(event.campaign_id).await.map_err(DocflowError::from),
            Err(err) => Err(err),
        };
        let result = match campaign {
            Ok(campaign) => self.service.notify(&campaign, event).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!(
                event_type = %event.kind,
                job_id = %event.job_id,
                error = %err,
                "Notification could not be attempted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::NotificationSettings;
    use crate::notifications::signing::verify_signature;
    use crate::notifications::transport::{MockWebhookTransport, TransportError, WebhookResponse};
    use crate::pipeline::{InMemoryJobQueue, PipelineDefinition, StageConfig};
    use crate::storage::{InMemoryControlStore, InMemoryStoreFactory};
    use crate::utils::ManualClock;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        tenants: TenantManager,
        queue: Arc<InMemoryJobQueue>,
        clock: Arc<ManualClock>,
        tenant: TenantId,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let tenants = TenantManager::new(
            Arc::new(InMemoryControlStore::new()),
            Arc::new(InMemoryStoreFactory::new()),
            clock.clone(),
        );
        let tenant = TenantId::new("acme");
        tenants
            .provision(tenant.clone(), "Acme", "memory://acme")
            .await
            .unwrap();
        tenants.activate(&tenant).await.unwrap();
        Fixture {
            tenants,
            queue: Arc::new(InMemoryJobQueue::new(clock.clone())),
            clock,
            tenant,
        }
    }

    fn service(fx: &Fixture, transport: MockWebhookTransport) -> NotificationService {
        NotificationService::new(
            Arc::new(transport),
            fx.queue.clone(),
            fx.clock.clone(),
            fx.tenants.clone(),
            NotificationConfig::default(),
        )
    }

    fn campaign(fx: &Fixture) -> Campaign {
        Campaign::new(
            Uuid::new_v4(),
            "loans",
            PipelineDefinition::new(vec![StageConfig::new("extract", "extractor")]),
            fx.clock.now(),
        )
        .with_notifications(
            NotificationSettings::new("https://hooks.example.com/docflow", "s3cret")
                .with_event(EventType::DocumentCompleted),
        )
    }

    fn event(fx: &Fixture, campaign: &Campaign, kind: EventType) -> LifecycleEvent {
        LifecycleEvent::new(
            kind,
            fx.tenant.clone(),
            campaign.id,
            Uuid::new_v4(),
            Uuid::new_v4(),
            fx.clock.now(),
        )
    }

    #[tokio::test]
    async fn test_delivered_request_is_signed() {
        let fx = fixture().await;
        let campaign = campaign(&fx);
        let mut transport = MockWebhookTransport::new();
        transport
            .expect_send()
            .times(1)
            .withf(|request| {
                let signature = request.header(SIGNATURE_HEADER).unwrap_or_default();
                request.url == "https://hooks.example.com/docflow"
                    && request.header(EVENT_HEADER) == Some("document.completed")
                    && request.header(ATTEMPT_HEADER) == Some("1")
                    && signature.starts_with("sha256=")
                    && verify_signature("s3cret", &request.body, signature)
            })
            .returning(|_| Ok(WebhookResponse { status: 200 }));
        let service = service(&fx, transport);
        let event = event(&fx, &campaign, EventType::DocumentCompleted);

        let record = fx
            .tenants
            .run(&fx.tenant, async { service.notify(&campaign, &event).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.response_status, Some(200));
        assert_eq!(record.payload["delivery_id"], serde_json::json!(record.delivery_id));
        assert_eq!(fx.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_event_is_not_sent() {
        let fx = fixture().await;
        let campaign = campaign(&fx);
        let mut transport = MockWebhookTransport::new();
        transport.expect_send().times(0);
        let service = service(&fx, transport);
        let event = event(&fx, &campaign, EventType::DocumentFailed);

        let record = fx
            .tenants
            .run(&fx.tenant, async { service.notify(&campaign, &event).await })
            .await
            .unwrap();

        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let fx = fixture().await;
        let campaign = campaign(&fx);
        let mut transport = MockWebhookTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(TransportError::Timeout));
        let service = service(&fx, transport);
        let event = event(&fx, &campaign, EventType::DocumentCompleted);

        let record = fx
            .tenants
            .run(&fx.tenant, async { service.notify(&campaign, &event).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("request timed out"));
        assert_eq!(
            fx.queue.delays_where(|m| matches!(m, DispatchMessage::NotificationRetry { .. })),
            vec![Duration::from_secs(60)]
        );
        assert_eq!(
            fx.queue.history()[0].message,
            DispatchMessage::NotificationRetry {
                tenant_id: fx.tenant.clone(),
                delivery_id: record.delivery_id,
                attempt: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_retry_is_idempotent_per_attempt() {
        let fx = fixture().await;
        let campaign = campaign(&fx);
        let mut transport = MockWebhookTransport::new();
        let mut statuses = vec![503_u16, 200].into_iter();
        transport
            .expect_send()
            .times(2)
            .returning(move |_| Ok(WebhookResponse { status: statuses.next().unwrap_or(200) }));
        let service = service(&fx, transport);
        let event = event(&fx, &campaign, EventType::DocumentCompleted);

        let first = fx
            .tenants
            .run(&fx.tenant, async {
                let store = TenantContext::scoped_store()?;
                store.put_campaign(campaign.clone()).await?;
                service.notify(&campaign, &event).await
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.response_status, Some(503));

        let second = service.retry(&fx.tenant, first.delivery_id, 2).await.unwrap().unwrap();
        assert_eq!(second.status, DeliveryStatus::Delivered);
        assert_eq!(second.payload, first.payload);

        let replayed = service.retry(&fx.tenant, first.delivery_id, 2).await.unwrap();
        assert!(replayed.is_none());
    }
}
