//! Mock capabilities and transports.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::StageContext;
use crate::core::StageOutcome;
use crate::ingest::DocumentIntake;
use crate::notifications::{TransportError, WebhookRequest, WebhookResponse, WebhookTransport};
use crate::stages::{CapabilityDescriptor, StageCapability};

/// Shared invocation counter handed out before a capability is registered.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Number of invocations so far.
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A capability that always succeeds with a fixed output.
#[derive(Debug)]
pub struct StaticCapability {
    name: String,
    output: serde_json::Map<String, serde_json::Value>,
    calls: CallCounter,
}

impl StaticCapability {
    /// Creates a capability succeeding with an empty output.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: serde_json::Map::new(),
            calls: CallCounter::default(),
        }
    }

    /// Adds an output field.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.output.insert(key.into(), value);
        self
    }

    /// Returns a handle on the invocation count.
    #[must_use]
    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

#[async_trait]
impl StageCapability for StaticCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutcome {
        self.calls.bump();
        StageOutcome::success(self.output.clone())
    }
}

/// A capability that plays back a list of outcomes, repeating the last one
/// once the list runs out.
#[derive(Debug)]
pub struct ScriptedCapability {
    name: String,
    script: Mutex<VecDeque<StageOutcome>>,
    last: Mutex<Option<StageOutcome>>,
    latency: Option<Duration>,
    calls: CallCounter,
    inputs: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedCapability {
    /// Creates a capability playing `outcomes` in order.
    #[must_use]
    pub fn new(name: impl Into<String>, outcomes: Vec<StageOutcome>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(outcomes.into()),
            last: Mutex::new(None),
            latency: None,
            calls: CallCounter::default(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Sleeps for `latency` before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns a handle on the invocation count.
    #[must_use]
    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }

    /// Input snapshots of every invocation.
    #[must_use]
    pub fn inputs(&self) -> Vec<serde_json::Value> {
        self.inputs.lock().clone()
    }

    fn next_outcome(&self) -> StageOutcome {
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last.clone().unwrap_or_else(StageOutcome::success_empty),
        }
    }
}

#[async_trait]
impl StageCapability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutcome {
        self.calls.bump();
        self.inputs.lock().push(ctx.input_snapshot());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_outcome()
    }
}

/// A capability that asks to wait for an external signal.
#[derive(Debug)]
pub struct AwaitingCapability {
    name: String,
    correlation_id: String,
    timeout: Option<Duration>,
    output: serde_json::Map<String, serde_json::Value>,
    calls: CallCounter,
}

impl AwaitingCapability {
    /// Creates a capability waiting on `correlation_id`.
    #[must_use]
    pub fn new(name: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_id: correlation_id.into(),
            timeout: None,
            output: serde_json::Map::new(),
            calls: CallCounter::default(),
        }
    }

    /// Overrides the signal deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a field to the partial output recorded before the wait.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.output.insert(key.into(), value);
        self
    }

    /// Returns a handle on the invocation count.
    #[must_use]
    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

#[async_trait]
impl StageCapability for AwaitingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::default().suspending()
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutcome {
        self.calls.bump();
        let mut outcome = StageOutcome::await_signal(self.correlation_id.clone()).with_output(self.output.clone());
        if let Some(timeout) = self.timeout {
            outcome = outcome.with_signal_timeout(timeout);
        }
        outcome
    }
}

/// A capability that cancels its own job mid-run, then answers with a fixed
/// outcome, as if an operator cancelled while the stage was in flight.
#[derive(Debug)]
pub struct CancellingCapability {
    name: String,
    intake: DocumentIntake,
    outcome: StageOutcome,
    calls: CallCounter,
}

impl CancellingCapability {
    /// Creates a capability that cancels through `intake` and then returns
    /// `outcome`.
    #[must_use]
    pub fn new(name: impl Into<String>, intake: DocumentIntake, outcome: StageOutcome) -> Self {
        Self {
            name: name.into(),
            intake,
            outcome,
            calls: CallCounter::default(),
        }
    }

    /// Returns a handle on the invocation count.
    #[must_use]
    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

#[async_trait]
impl StageCapability for CancellingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::default().suspending()
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutcome {
        self.calls.bump();
        if let Err(err) = self.intake.cancel(ctx.tenant_id(), ctx.job_id).await {
            return StageOutcome::fail_permanent(format!("cancel failed: {err}"));
        }
        self.outcome.clone()
    }
}

/// A webhook transport that records requests and answers from a script.
///
/// Once the script runs out it answers with the fallback (200 unless set).
#[derive(Debug)]
pub struct RecordingTransport {
    requests: Mutex<Vec<WebhookRequest>>,
    script: Mutex<VecDeque<Result<WebhookResponse, TransportError>>>,
    fallback: Result<WebhookResponse, TransportError>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    /// A transport that accepts everything with 200.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(WebhookResponse { status: 200 }),
        }
    }

    /// A transport that always answers `status`.
    #[must_use]
    pub fn failing(status: u16) -> Self {
        Self {
            fallback: Ok(WebhookResponse { status }),
            ..Self::new()
        }
    }

    /// A transport whose endpoint can never be reached.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            fallback: Err(TransportError::Connection("connection refused".to_string())),
            ..Self::new()
        }
    }

    /// Queues a status to answer before the fallback applies.
    pub fn push_status(&self, status: u16) {
        self.script.lock().push_back(Ok(WebhookResponse { status }));
    }

    /// Every request sent so far.
    #[must_use]
    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
