//! Stage invocation shared by both engines.
//!
//! Each call appends one [`StageExecution`] row before the capability runs
//! and settles it afterwards. Rows are never reused across attempts.

use crate::context::StageContext;
use crate::core::StageOutcome;
use crate::errors::DocflowError;
use crate::observability::{SpanTimer, StageSpanAttributes};
use crate::pipeline::{routing, StageConfig};
use crate::stages::StageCapability;
use crate::state::{StageExecution, StageExecutionState};
use crate::storage::TenantStore;
use crate::utils::{generate_id, Clock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

/// A row appended in `Running` plus the capability's outcome.
#[derive(Debug)]
pub struct StageRun {
    /// The execution row, still `Running` in storage.
    pub execution: StageExecution,
    /// What the capability reported.
    pub outcome: StageOutcome,
}

/// Outputs of completed stages keyed by stage id. Later rows win.
#[must_use]
pub fn prior_outputs(executions: &[StageExecution]) -> serde_json::Map<String, serde_json::Value> {
    let mut outputs = serde_json::Map::new();
    for row in executions {
        if row.state == StageExecutionState::Completed {
            outputs.insert(row.stage_id.clone(), serde_json::Value::Object(row.output.clone()));
        }
    }
    outputs
}

/// Attempt number for the next run of `stage_id`.
#[must_use]
pub fn next_attempt(executions: &[StageExecution], stage_id: &str) -> u32 {
    let runs = executions
        .iter()
        .filter(|row| row.stage_id == stage_id && row.state != StageExecutionState::Skipped)
        .count();
    u32::try_from(runs).unwrap_or(u32::MAX).saturating_add(1)
}

/// Evaluates a stage's `when` guard against prior outputs.
///
/// A stage without a guard always runs.
///
/// # Errors
///
/// Fails on a malformed guard expression.
pub fn guard_allows(stage: &StageConfig, prior: &serde_json::Map<String, serde_json::Value>) -> Result<bool, DocflowError> {
    match stage.when.as_deref() {
        Some(expr) => Ok(routing::evaluate(expr, &serde_json::Value::Object(prior.clone()))?),
        None => Ok(true),
    }
}

/// Appends a `Skipped` row for a stage whose guard did not match.
pub async fn record_skip(
    store: &dyn TenantStore,
    job_id: Uuid,
    stage: &StageConfig,
    attempt: u32,
    clock: &dyn Clock,
) -> Result<StageExecution, DocflowError> {
    let now = clock.now();
    let mut row = StageExecution::new(generate_id(), job_id, &stage.id, &stage.capability, attempt, now)
        .with_snapshots(serde_json::Value::Null, stage.config.clone());
    let reason = stage
        .when
        .as_deref()
        .map_or_else(|| "guard did not match".to_string(), |expr| format!("guard '{expr}' is false"));
    row.skip(reason, now)?;
    store.append_execution(row.clone()).await?;
    debug!(job_id = %job_id, stage_id = %stage.id, "Stage skipped");
    Ok(row)
}

/// Appends a `Failed` row for a stage rejected before its capability ran
/// (unmet dependency, unknown capability).
pub async fn record_rejection(
    store: &dyn TenantStore,
    job_id: Uuid,
    stage: &StageConfig,
    attempt: u32,
    error: &DocflowError,
    clock: &dyn Clock,
) -> Result<StageExecution, DocflowError> {
    let now = clock.now();
    let mut row = StageExecution::new(generate_id(), job_id, &stage.id, &stage.capability, attempt, now)
        .with_snapshots(serde_json::Value::Null, stage.config.clone());
    row.start(now)?;
    row.fail(error.to_string(), now)?;
    store.append_execution(row.clone()).await?;
    Ok(row)
}

/// Appends a `Running` row and invokes the capability.
///
/// A capability that exceeds `timeout` is reported as a retryable failure.
pub async fn invoke(
    store: &dyn TenantStore,
    capability: &Arc<dyn StageCapability>,
    ctx: &StageContext,
    timeout: Option<Duration>,
    clock: &dyn Clock,
) -> Result<StageRun, DocflowError> {
    let now = clock.now();
    let mut execution = StageExecution::new(
        generate_id(),
        ctx.job_id,
        &ctx.stage.id,
        &ctx.stage.capability,
        ctx.attempt,
        now,
    )
    .with_snapshots(ctx.input_snapshot(), ctx.stage.config.clone());
    execution.start(now)?;
    store.append_execution(execution.clone()).await?;

    debug!(
        job_id = %ctx.job_id,
        stage_id = %ctx.stage.id,
        capability = %ctx.stage.capability,
        attempt = ctx.attempt,
        "Invoking stage"
    );

    let span = StageSpanAttributes::new(&ctx.stage.id)
        .with_capability(&ctx.stage.capability)
        .with_attempt(ctx.attempt)
        .span();
    let timer = SpanTimer::start();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, capability.execute(ctx)).instrument(span).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(job_id = %ctx.job_id, stage_id = %ctx.stage.id, timeout_ms = limit.as_millis() as u64, "Stage timed out");
                StageOutcome::fail(format!("stage timed out after {}ms", limit.as_millis()))
            }
        },
        None => capability.execute(ctx).instrument(span).await,
    };
    debug!(
        job_id = %ctx.job_id,
        stage_id = %ctx.stage.id,
        status = ?outcome.status,
        elapsed_ms = timer.elapsed_ms(),
        "Stage returned"
    );

    Ok(StageRun { execution, outcome })
}

/// Settles a running row as `Completed` with the outcome's payload.
pub async fn record_success(
    store: &dyn TenantStore,
    execution: &mut StageExecution,
    outcome: &StageOutcome,
    clock: &dyn Clock,
) -> Result<(), DocflowError> {
    execution.complete(outcome.output.clone(), clock.now())?;
    execution.artifacts = outcome.artifacts.clone();
    execution.usage = outcome.usage.clone();
    store.update_execution(execution).await?;
    Ok(())
}

/// Settles a running row as `Failed`.
pub async fn record_failure(
    store: &dyn TenantStore,
    execution: &mut StageExecution,
    outcome: &StageOutcome,
    clock: &dyn Clock,
) -> Result<(), DocflowError> {
    let message = outcome.error.clone().unwrap_or_else(|| "stage failed".to_string());
    execution.fail(message, clock.now())?;
    execution.usage = outcome.usage.clone();
    store.update_execution(execution).await?;
    Ok(())
}
