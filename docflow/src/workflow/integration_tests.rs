//! End-to-end scenarios for the durable workflow engine: signals, timeouts,
//! parallel groups, routing and resumption.

use super::{SignalDisposition, WorkflowStatus};
use crate::core::{EventType, StageOutcome};
use crate::pipeline::{PipelineDefinition, StageConfig};
use crate::state::{DocumentState, JobState, StageExecution, StageExecutionState};
use crate::tenant::{TenantContext, TenantId};
use crate::testing::{AwaitingCapability, ScriptedCapability, StaticCapability, TestHarness};
use crate::utils::{generate_id, Clock};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

fn payload(fields: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match fields {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn kyc_pipeline() -> PipelineDefinition {
    PipelineDefinition::new(vec![
        StageConfig::new("extract", "extractor"),
        StageConfig::new("verify", "kyc").depends_on(&["extract"]),
        StageConfig::new("finalize", "finalizer").depends_on(&["verify"]),
    ])
}

fn fan_out_pipeline() -> PipelineDefinition {
    PipelineDefinition::new(vec![
        StageConfig::new("extract", "extractor"),
        StageConfig::new("ocr", "ocr").in_group("analysis"),
        StageConfig::new("classify", "classifier").in_group("analysis"),
        StageConfig::new("fraud", "fraud").in_group("analysis"),
        StageConfig::new("merge", "merger").depends_on(&["ocr", "classify", "fraud"]),
    ])
}

async fn start(harness: &TestHarness, pipeline: PipelineDefinition) -> (TenantId, Uuid) {
    let tenant = harness.tenant("acme").await;
    let campaign = harness.workflow_campaign(&tenant, pipeline).await;
    let (_, job_id) = harness.submit(&tenant, campaign, "hash-1").await;
    (tenant, job_id)
}

fn summary(rows: &[StageExecution]) -> Vec<(&str, u32, StageExecutionState)> {
    rows.iter().map(|r| (r.stage_id.as_str(), r.attempt, r.state)).collect()
}

#[tokio::test]
async fn test_signal_within_window_resumes_workflow() {
    let harness = TestHarness::new();
    let extractor = StaticCapability::new("extractor");
    let extract_calls = extractor.call_counter();
    harness.register(extractor);
    harness.register(
        AwaitingCapability::new("kyc", "kyc-42")
            .with_output("status", json!("pending"))
            .with_output("requested", json!(true)),
    );
    harness.register(StaticCapability::new("finalizer"));
    let (tenant, job_id) = start(&harness, kyc_pipeline()).await;

    harness.run_to_completion().await;

    let checkpoint = harness
        .workflow_engine()
        .checkpoint(&tenant, job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.status, WorkflowStatus::Suspended);
    assert_eq!(checkpoint.awaiting, vec!["kyc-42"]);
    assert_eq!(checkpoint.completed_stages, vec!["extract"]);
    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Running);

    harness.clock.advance(Duration::from_secs(3600));
    let disposition = harness
        .workflow_engine()
        .signal("kyc-42", payload(json!({"status": "approved", "score": 0.93})))
        .await
        .unwrap();
    assert_eq!(disposition, SignalDisposition::Resumed { workflow_id: job_id });

    harness.run_to_completion().await;

    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
    assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Completed);
    assert_eq!(extract_calls.get(), 1);

    let rows = harness.executions(&tenant, job_id).await;
    assert_eq!(
        summary(&rows),
        vec![
            ("extract", 1, StageExecutionState::Completed),
            ("verify", 1, StageExecutionState::Completed),
            ("finalize", 1, StageExecutionState::Completed),
        ]
    );
    assert_eq!(rows[1].output["status"], "approved");
    assert_eq!(rows[1].output["score"], 0.93);
    assert_eq!(rows[1].output["requested"], true);
    assert_eq!(harness.events.count(EventType::WorkflowSuspended), 1);
    assert_eq!(harness.events.count(EventType::WorkflowResumed), 1);
}

#[tokio::test]
async fn test_signal_wait_times_out() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("extractor"));
    harness.register(AwaitingCapability::new("kyc", "kyc-7").with_timeout(Duration::from_secs(3600)));
    harness.register(StaticCapability::new("finalizer"));
    let (tenant, job_id) = start(&harness, kyc_pipeline()).await;

    harness.run_to_completion().await;
    assert_eq!(harness.drain().await.expired_waits, 0);

    harness.clock.advance(Duration::from_secs(2 * 3600));
    let report = harness.drain().await;
    assert_eq!(report.expired_waits, 1);

    let job = harness.job(&tenant, job_id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.errors.last().map(|e| e.code.as_str()), Some("CALLBACK_TIMEOUT"));
    assert_eq!(harness.document_state(&tenant, job_id).await, DocumentState::Failed);

    let rows = harness.executions(&tenant, job_id).await;
    let verify = rows.iter().find(|r| r.stage_id == "verify").unwrap();
    assert_eq!(verify.state, StageExecutionState::Failed);
    assert!(verify.timed_out);
    assert!(rows.iter().all(|r| r.stage_id != "finalize"));

    let checkpoint = harness
        .workflow_engine()
        .checkpoint(&tenant, job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.status, WorkflowStatus::Failed);

    let late = harness
        .workflow_engine()
        .signal("kyc-7", payload(json!({"status": "approved"})))
        .await
        .unwrap();
    assert_eq!(late, SignalDisposition::Buffered);
    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Failed);
}

#[tokio::test]
async fn test_signal_before_wait_is_buffered_and_consumed() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("extractor"));
    harness.register(AwaitingCapability::new("kyc", "kyc-early"));
    harness.register(StaticCapability::new("finalizer"));

    let early = harness
        .workflow_engine()
        .signal("kyc-early", payload(json!({"status": "approved"})))
        .await
        .unwrap();
    assert_eq!(early, SignalDisposition::Buffered);

    let (tenant, job_id) = start(&harness, kyc_pipeline()).await;
    harness.run_to_completion().await;

    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
    let rows = harness.executions(&tenant, job_id).await;
    assert_eq!(rows[1].output["status"], "approved");
    assert_eq!(harness.events.count(EventType::WorkflowSuspended), 0);
    assert_eq!(harness.events.count(EventType::WorkflowResumed), 1);
    assert!(harness.services.control.wait("kyc-early").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_signal_is_ignored() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("extractor"));
    harness.register(AwaitingCapability::new("kyc", "kyc-9"));
    harness.register(StaticCapability::new("finalizer"));
    let (tenant, job_id) = start(&harness, kyc_pipeline()).await;
    harness.run_to_completion().await;

    let engine = harness.workflow_engine();
    let first = engine.signal("kyc-9", payload(json!({"status": "approved"}))).await.unwrap();
    let second = engine.signal("kyc-9", payload(json!({"status": "rejected"}))).await.unwrap();
    assert_eq!(first, SignalDisposition::Resumed { workflow_id: job_id });
    assert_eq!(second, SignalDisposition::Duplicate);

    harness.run_to_completion().await;

    let rows = harness.executions(&tenant, job_id).await;
    assert_eq!(rows[1].output["status"], "approved");
    assert_eq!(harness.events.count(EventType::WorkflowResumed), 1);
    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_group_fans_out_and_in() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("extractor"));
    for name in ["ocr", "classifier", "fraud"] {
        harness.register(
            ScriptedCapability::new(name, vec![StageOutcome::success_empty()]).with_latency(Duration::from_secs(1)),
        );
    }
    let merger = ScriptedCapability::new("merger", vec![StageOutcome::success_empty()]);
    harness.register(merger);
    let (tenant, job_id) = start(&harness, fan_out_pipeline()).await;

    let started = tokio::time::Instant::now();
    harness.run_to_completion().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let rows = harness.executions(&tenant, job_id).await;
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r.state == StageExecutionState::Completed));
    assert_eq!(rows.last().map(|r| r.stage_id.as_str()), Some("merge"));
    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
}

#[tokio::test]
async fn test_permanent_branch_failure_fails_workflow() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("extractor"));
    harness.register(StaticCapability::new("ocr"));
    harness.register(StaticCapability::new("classifier"));
    harness.register(ScriptedCapability::new("fraud", vec![StageOutcome::fail_permanent("tampered image")]));
    let merger = StaticCapability::new("merger");
    let merge_calls = merger.call_counter();
    harness.register(merger);
    let (tenant, job_id) = start(&harness, fan_out_pipeline()).await;

    harness.run_to_completion().await;

    let job = harness.job(&tenant, job_id).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.final_failure);
    assert_eq!(merge_calls.get(), 0);

    let rows = harness.executions(&tenant, job_id).await;
    let state_of = |stage: &str| rows.iter().find(|r| r.stage_id == stage).map(|r| r.state);
    assert_eq!(state_of("ocr"), Some(StageExecutionState::Completed));
    assert_eq!(state_of("classify"), Some(StageExecutionState::Completed));
    assert_eq!(state_of("fraud"), Some(StageExecutionState::Failed));
    assert_eq!(state_of("merge"), None);
    assert_eq!(harness.events.count(EventType::DocumentFailed), 1);
}

#[tokio::test]
async fn test_retryable_branch_failure_reruns_only_failed_member() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("extractor"));
    let ocr = StaticCapability::new("ocr");
    let ocr_calls = ocr.call_counter();
    harness.register(ocr);
    harness.register(StaticCapability::new("classifier"));
    let fraud = ScriptedCapability::new(
        "fraud",
        vec![StageOutcome::fail("scoring service timeout"), StageOutcome::success_empty()],
    );
    let fraud_calls = fraud.call_counter();
    harness.register(fraud);
    harness.register(StaticCapability::new("merger"));
    let (tenant, job_id) = start(&harness, fan_out_pipeline()).await;

    harness.run_to_completion().await;

    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
    assert_eq!(harness.events.count(EventType::JobRetryScheduled), 1);
    assert_eq!(ocr_calls.get(), 1);
    assert_eq!(fraud_calls.get(), 2);

    let rows = harness.executions(&tenant, job_id).await;
    let fraud_rows: Vec<_> = rows
        .iter()
        .filter(|r| r.stage_id == "fraud")
        .map(|r| (r.attempt, r.state))
        .collect();
    assert_eq!(
        fraud_rows,
        vec![(1, StageExecutionState::Failed), (2, StageExecutionState::Completed)]
    );
}

#[tokio::test]
async fn test_branch_routes_past_unselected_stage() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("classifier").with_output("doc_type", json!("invoice")));
    let receipts = StaticCapability::new("receipts");
    let receipt_calls = receipts.call_counter();
    harness.register(receipts);
    harness.register(StaticCapability::new("invoices"));
    harness.register(StaticCapability::new("archiver"));
    let pipeline = PipelineDefinition::new(vec![
        StageConfig::new("classify", "classifier").with_branch(r#"doc_type == "invoice""#, "invoice"),
        StageConfig::new("receipt", "receipts").with_next("archive"),
        StageConfig::new("invoice", "invoices"),
        StageConfig::new("archive", "archiver"),
    ]);
    let (tenant, job_id) = start(&harness, pipeline).await;

    harness.run_to_completion().await;

    let rows = harness.executions(&tenant, job_id).await;
    let stages: Vec<_> = rows.iter().map(|r| r.stage_id.as_str()).collect();
    assert_eq!(stages, vec!["classify", "invoice", "archive"]);
    assert_eq!(receipt_calls.get(), 0);

    let checkpoint = harness
        .workflow_engine()
        .checkpoint(&tenant, job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.completed_stages, vec!["classify", "invoice", "archive"]);
}

#[tokio::test]
async fn test_guard_skips_stage_on_prior_output() {
    let harness = TestHarness::new();
    harness.register(StaticCapability::new("classifier").with_output("needs_review", json!(false)));
    let reviewer = StaticCapability::new("reviewer");
    let review_calls = reviewer.call_counter();
    harness.register(reviewer);
    harness.register(StaticCapability::new("archiver"));
    let pipeline = PipelineDefinition::new(vec![
        StageConfig::new("classify", "classifier"),
        StageConfig::new("review", "reviewer").with_guard("classify.needs_review"),
        StageConfig::new("archive", "archiver"),
    ]);
    let (tenant, job_id) = start(&harness, pipeline).await;

    harness.run_to_completion().await;

    let rows = harness.executions(&tenant, job_id).await;
    assert_eq!(
        summary(&rows),
        vec![
            ("classify", 1, StageExecutionState::Completed),
            ("review", 1, StageExecutionState::Skipped),
            ("archive", 1, StageExecutionState::Completed),
        ]
    );
    assert_eq!(review_calls.get(), 0);
    assert_eq!(harness.events.count(EventType::StageSkipped), 1);
    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
}

#[tokio::test]
async fn test_interrupted_stage_is_settled_and_rerun() {
    let harness = TestHarness::new();
    let extractor = StaticCapability::new("extractor");
    let extract_calls = extractor.call_counter();
    harness.register(extractor);
    harness.register(StaticCapability::new("classifier"));
    let pipeline = PipelineDefinition::new(vec![
        StageConfig::new("extract", "extractor"),
        StageConfig::new("classify", "classifier").depends_on(&["extract"]),
    ]);
    let (tenant, job_id) = start(&harness, pipeline).await;

    let now = harness.clock.now();
    harness
        .services
        .tenants
        .run(&tenant, async move {
            let mut orphan = StageExecution::new(generate_id(), job_id, "extract", "extractor", 1, now);
            orphan.start(now)?;
            TenantContext::scoped_store()?.append_execution(orphan).await?;
            Ok(())
        })
        .await
        .unwrap();

    harness.run_to_completion().await;

    let rows = harness.executions(&tenant, job_id).await;
    assert_eq!(
        summary(&rows),
        vec![
            ("extract", 1, StageExecutionState::Failed),
            ("extract", 2, StageExecutionState::Completed),
            ("classify", 1, StageExecutionState::Completed),
        ]
    );
    assert_eq!(rows[0].error.as_deref(), Some("interrupted before completion"));
    assert_eq!(extract_calls.get(), 1);
    assert_eq!(harness.job(&tenant, job_id).await.state, JobState::Completed);
}
