//! Rebuilds a workflow's position from its execution rows.
//!
//! The durable engine never trusts in-memory progress. Each time it runs it
//! walks the pipeline from the first stage, following the route recorded
//! outputs select, until it reaches a step that still has work to do.

use crate::errors::DocflowError;
use crate::pipeline::PipelineDefinition;
use crate::state::{StageExecution, StageExecutionState};
use std::collections::HashMap;
use std::ops::Range;
use uuid::Uuid;

/// Where a workflow stands.
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    /// Every stage on the route finished.
    Done,
    /// Every member of the current step finished or awaits a signal.
    Waiting {
        /// First stage of the step.
        position: usize,
        /// Correlation ids still awaited.
        awaiting: Vec<String>,
    },
    /// Members of the current step must run.
    Run {
        /// The whole step (a single stage or a parallel group).
        range: Range<usize>,
        /// Indices of the members to run.
        pending: Vec<usize>,
        /// Ids of `Running` rows left behind by a dispatch that never
        /// settled them.
        interrupted: Vec<Uuid>,
    },
}

/// Result of a replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// Stage ids the workflow moved past, in route order.
    pub completed: Vec<String>,
    /// What happens next.
    pub next: NextStep,
}

/// Replays `executions` over `pipeline`.
///
/// Only the latest row of each stage counts.
///
/// # Errors
///
/// Fails on a malformed routing condition, or if a route points back to a
/// stage the workflow already passed.
pub fn replay(pipeline: &PipelineDefinition, executions: &[StageExecution]) -> Result<Replay, DocflowError> {
    let latest: HashMap<&str, &StageExecution> = executions
        .iter()
        .map(|row| (row.stage_id.as_str(), row))
        .collect();

    let mut completed = Vec::new();
    let mut index = 0;
    while index < pipeline.len() {
        let range = pipeline.step_at(index);
        let mut pending = Vec::new();
        let mut awaiting = Vec::new();
        let mut interrupted = Vec::new();

        for member in range.clone() {
            let stage = &pipeline.stages[member];
            match latest.get(stage.id.as_str()) {
                Some(row) if matches!(row.state, StageExecutionState::Completed | StageExecutionState::Skipped) => {}
                Some(row) if row.is_awaiting_signal() => {
                    awaiting.push(row.correlation_id.clone().unwrap_or_default());
                }
                Some(row) if row.state == StageExecutionState::Running => {
                    interrupted.push(row.id);
                    pending.push(member);
                }
                _ => pending.push(member),
            }
        }

        if !pending.is_empty() {
            return Ok(Replay {
                completed,
                next: NextStep::Run {
                    range,
                    pending,
                    interrupted,
                },
            });
        }
        if !awaiting.is_empty() {
            return Ok(Replay {
                completed,
                next: NextStep::Waiting {
                    position: range.start,
                    awaiting,
                },
            });
        }

        completed.extend(range.clone().map(|member| pipeline.stages[member].id.clone()));

        // Routing reads the output of a single completed stage; groups and
        // skipped stages route on nothing.
        let output = if range.len() == 1 {
            latest
                .get(pipeline.stages[range.start].id.as_str())
                .filter(|row| row.state == StageExecutionState::Completed)
                .map_or(serde_json::Value::Null, |row| serde_json::Value::Object(row.output.clone()))
        } else {
            serde_json::Value::Null
        };

        match pipeline.next_after(range.start, &output)? {
            None => break,
            Some(next) if next <= index => {
                return Err(DocflowError::Internal(format!(
                    "route from '{}' moves back to '{}'",
                    pipeline.stages[range.start].id, pipeline.stages[next].id
                )));
            }
            Some(next) => index = next,
        }
    }

    Ok(Replay {
        completed,
        next: NextStep::Done,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageConfig;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn row(stage_id: &str, state: StageExecutionState) -> StageExecution {
        let mut row = StageExecution::new(Uuid::new_v4(), Uuid::nil(), stage_id, "cap", 1, Utc::now());
        row.state = state;
        row
    }

    fn linear() -> PipelineDefinition {
        PipelineDefinition::new(vec![
            StageConfig::new("extract", "cap"),
            StageConfig::new("classify", "cap"),
            StageConfig::new("validate", "cap"),
        ])
    }

    #[test]
    fn test_fresh_workflow_runs_first_stage() {
        let replay = replay(&linear(), &[]).unwrap();
        assert!(replay.completed.is_empty());
        assert_eq!(
            replay.next,
            NextStep::Run {
                range: 0..1,
                pending: vec![0],
                interrupted: vec![]
            }
        );
    }

    #[test]
    fn test_resumes_past_completed_stages() {
        let rows = vec![
            row("extract", StageExecutionState::Completed),
            row("classify", StageExecutionState::Failed),
            row("classify", StageExecutionState::Completed),
        ];
        let replay = replay(&linear(), &rows).unwrap();

        assert_eq!(replay.completed, vec!["extract", "classify"]);
        assert!(matches!(replay.next, NextStep::Run { range, .. } if range == (2..3)));
    }

    #[test]
    fn test_all_completed_is_done() {
        let rows = vec![
            row("extract", StageExecutionState::Completed),
            row("classify", StageExecutionState::Skipped),
            row("validate", StageExecutionState::Completed),
        ];
        assert_eq!(replay(&linear(), &rows).unwrap().next, NextStep::Done);
    }

    #[test]
    fn test_awaiting_row_waits() {
        let mut waiting = row("classify", StageExecutionState::Running);
        waiting.correlation_id = Some("cb-1".into());
        let rows = vec![row("extract", StageExecutionState::Completed), waiting];

        assert_eq!(
            replay(&linear(), &rows).unwrap().next,
            NextStep::Waiting {
                position: 1,
                awaiting: vec!["cb-1".to_string()]
            }
        );
    }

    #[test]
    fn test_running_row_without_correlation_is_interrupted() {
        let rows = vec![row("extract", StageExecutionState::Running)];
        let NextStep::Run { interrupted, pending, .. } = replay(&linear(), &rows).unwrap().next else {
            panic!("expected run");
        };
        assert_eq!(pending, vec![0]);
        assert_eq!(interrupted, vec![rows[0].id]);
    }

    #[test]
    fn test_group_runs_pending_members_before_waiting() {
        let pipeline = PipelineDefinition::new(vec![
            StageConfig::new("ocr", "cap").in_group("fanout"),
            StageConfig::new("kyc", "cap").in_group("fanout"),
            StageConfig::new("merge", "cap"),
        ]);
        let mut waiting = row("kyc", StageExecutionState::Running);
        waiting.correlation_id = Some("kyc-1".into());

        let NextStep::Run { range, pending, .. } = replay(&pipeline, &[waiting]).unwrap().next else {
            panic!("expected run");
        };
        assert_eq!(range, 0..2);
        assert_eq!(pending, vec![0]);
    }

    #[test]
    fn test_follows_branch_route() {
        let pipeline = PipelineDefinition::new(vec![
            StageConfig::new("classify", "cap").with_branch("doc_type == \"invoice\"", "invoice"),
            StageConfig::new("receipt", "cap").with_next("archive"),
            StageConfig::new("invoice", "cap"),
            StageConfig::new("archive", "cap"),
        ]);
        let mut classified = row("classify", StageExecutionState::Completed);
        classified.output.insert("doc_type".into(), serde_json::json!("invoice"));

        let replay = replay(&pipeline, &[classified]).unwrap();
        assert!(matches!(replay.next, NextStep::Run { range, .. } if range == (2..3)));
    }
}
