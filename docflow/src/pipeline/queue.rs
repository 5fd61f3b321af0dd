//! Dispatch queue.
//!
//! Work between stages, after a signal, and between notification attempts
//! crosses a queue. Messages only carry durable identifiers; the worker that
//! picks one up re-binds the tenant from `tenant_id` and reloads everything
//! else from storage.

use crate::errors::DocflowError;
use crate::tenant::TenantId;
use crate::utils::{to_chrono, Clock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchMessage {
    /// Run the next stage of a baseline-engine job.
    PipelineStep {
        /// Owning tenant.
        tenant_id: TenantId,
        /// Job to advance.
        job_id: Uuid,
    },
    /// Run or resume a durable workflow.
    WorkflowRun {
        /// Owning tenant.
        tenant_id: TenantId,
        /// Workflow (job) id.
        workflow_id: Uuid,
    },
    /// Retry a notification delivery.
    NotificationRetry {
        /// Owning tenant.
        tenant_id: TenantId,
        /// Stable delivery id.
        delivery_id: Uuid,
        /// Attempt number to make.
        attempt: u32,
    },
}

impl DispatchMessage {
    /// The tenant the message belongs to.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::PipelineStep { tenant_id, .. }
            | Self::WorkflowRun { tenant_id, .. }
            | Self::NotificationRetry { tenant_id, .. } => tenant_id,
        }
    }

    /// Key used by the dispatch guard.
    #[must_use]
    pub fn dispatch_key(&self) -> String {
        match self {
            Self::PipelineStep { job_id, .. } => format!("job:{job_id}"),
            Self::WorkflowRun { workflow_id, .. } => format!("job:{workflow_id}"),
            Self::NotificationRetry { delivery_id, .. } => format!("delivery:{delivery_id}"),
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PipelineStep { .. } => "pipeline_step",
            Self::WorkflowRun { .. } => "workflow_run",
            Self::NotificationRetry { .. } => "notification_retry",
        }
    }
}

/// A message waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Queue entry id.
    pub id: Uuid,
    /// Payload.
    pub message: DispatchMessage,
    /// Requested delay.
    pub delay: Duration,
    /// When it was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time it may run.
    pub ready_at: DateTime<Utc>,
}

/// A delayed-delivery work queue.
#[async_trait]
pub trait JobQueue: Send + Sync + Debug {
    /// Schedules `message` to become ready after `delay`.
    async fn enqueue(&self, message: DispatchMessage, delay: Duration) -> Result<Uuid, DocflowError>;

    /// Removes and returns up to `limit` messages ready at `now`, oldest
    /// `ready_at` first.
    async fn dequeue_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueuedMessage>, DocflowError>;

    /// Number of messages not yet dequeued.
    async fn pending(&self) -> usize;

    /// Earliest `ready_at` among pending messages.
    async fn next_ready_at(&self) -> Option<DateTime<Utc>>;

    /// Resolves when a message is enqueued.
    async fn notified(&self);
}

/// In-memory queue that also remembers everything it was asked to schedule.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<QueuedMessage>>,
    history: Mutex<Vec<QueuedMessage>>,
    notify: Notify,
}

impl InMemoryJobQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Every message ever enqueued, in order.
    #[must_use]
    pub fn history(&self) -> Vec<QueuedMessage> {
        self.history.lock().clone()
    }

    /// Delays of every enqueued message matching `predicate`.
    #[must_use]
    pub fn delays_where(&self, predicate: impl Fn(&DispatchMessage) -> bool) -> Vec<Duration> {
        self.history
            .lock()
            .iter()
            .filter(|q| predicate(&q.message))
            .map(|q| q.delay)
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: DispatchMessage, delay: Duration) -> Result<Uuid, DocflowError> {
        let now = self.clock.now();
        let queued = QueuedMessage {
            id: crate::utils::generate_id(),
            message,
            delay,
            enqueued_at: now,
            ready_at: now + to_chrono(delay),
        };
        tracing::debug!(
            queue_id = %queued.id,
            kind = queued.message.kind(),
            tenant_id = %queued.message.tenant_id(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Message enqueued"
        );
        let id = queued.id;
        self.history.lock().push(queued.clone());
        self.entries.lock().push(queued);
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueuedMessage>, DocflowError> {
        let mut entries = self.entries.lock();
        // Stable sort keeps FIFO order among equal ready times.
        entries.sort_by_key(|q| q.ready_at);
        let ready = entries.iter().take_while(|q| q.ready_at <= now).count().min(limit);
        Ok(entries.drain(..ready).collect())
    }

    async fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    async fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.entries.lock().iter().map(|q| q.ready_at).min()
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use pretty_assertions::assert_eq;

    fn step(job_id: Uuid) -> DispatchMessage {
        DispatchMessage::PipelineStep {
            tenant_id: TenantId::new("acme"),
            job_id,
        }
    }

    #[tokio::test]
    async fn test_delayed_messages_wait() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryJobQueue::new(clock.clone());
        let job = Uuid::new_v4();

        queue.enqueue(step(job), Duration::from_secs(60)).await.unwrap();
        assert!(queue.dequeue_ready(clock.now(), 10).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(60));
        let ready = queue.dequeue_ready(clock.now(), 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message, step(job));
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test]
    async fn test_fifo_and_limit() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryJobQueue::new(clock.clone());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.enqueue(step(a), Duration::ZERO).await.unwrap();
        queue.enqueue(step(b), Duration::ZERO).await.unwrap();
        queue.enqueue(step(c), Duration::ZERO).await.unwrap();

        let first = queue.dequeue_ready(clock.now(), 2).await.unwrap();
        assert_eq!(
            first.iter().map(|q| q.message.clone()).collect::<Vec<_>>(),
            vec![step(a), step(b)]
        );
        assert_eq!(queue.pending().await, 1);
    }

    #[tokio::test]
    async fn test_history_records_delays() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryJobQueue::new(clock);
        queue.enqueue(step(Uuid::new_v4()), Duration::from_secs(60)).await.unwrap();
        queue.enqueue(step(Uuid::new_v4()), Duration::from_secs(300)).await.unwrap();

        let delays = queue.delays_where(|m| matches!(m, DispatchMessage::PipelineStep { .. }));
        assert_eq!(delays, vec![Duration::from_secs(60), Duration::from_secs(300)]);
    }

    #[test]
    fn test_message_serializes_with_kind_tag() {
        let json = serde_json::to_value(step(Uuid::nil())).unwrap();
        assert_eq!(json["kind"], "pipeline_step");
        assert_eq!(json["tenant_id"], "acme");
    }

    #[test]
    fn test_dispatch_keys_share_job_namespace() {
        let id = Uuid::new_v4();
        let wf = DispatchMessage::WorkflowRun {
            tenant_id: TenantId::new("acme"),
            workflow_id: id,
        };
        assert_eq!(step(id).dispatch_key(), wf.dispatch_key());
    }
}
