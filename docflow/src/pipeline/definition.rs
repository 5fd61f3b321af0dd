//! Pipeline definitions.
//!
//! A [`PipelineDefinition`] is the ordered stage list a campaign owns. Jobs
//! store a frozen copy, so nothing here is ever mutated once a job starts.

use super::dag::find_cycle;
use super::routing::{self, Condition};
use super::StageRetryPolicy;
use crate::errors::{ErrorInfo, PipelineValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use std::time::Duration;

/// Which engine drives a campaign's jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// One stage per dispatch, re-enqueued between stages.
    #[default]
    Pipeline,
    /// Durable checkpointed workflow with signals and fan-out.
    Workflow,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Workflow => write!(f, "workflow"),
        }
    }
}

/// A conditional jump evaluated against a stage's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRule {
    /// Condition over the stage's output.
    pub when: String,
    /// Target stage id.
    pub next: String,
}

/// Configuration of one stage within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage identifier, unique within the pipeline.
    pub id: String,
    /// Registered capability that implements the stage.
    pub capability: String,
    /// Free-form configuration passed to the capability.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Stages that must have completed before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Unconditional successor, when not the next stage in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Conditional successors, first match wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchRule>,
    /// Contiguous stages sharing a group run concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// In-place retry policy (durable engine).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<StageRetryPolicy>,
    /// Per-invocation timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Deadline for an awaited signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_timeout_secs: Option<u64>,
    /// Guard over prior stage outputs; when false the stage is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

impl StageConfig {
    /// Creates a stage config.
    #[must_use]
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            config: serde_json::Map::new(),
            dependencies: Vec::new(),
            next: None,
            branches: Vec::new(),
            parallel_group: None,
            retry: None,
            timeout_secs: None,
            callback_timeout_secs: None,
            when: None,
        }
    }

    /// Adds a config entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Declares dependencies.
    #[must_use]
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies.extend(deps.iter().map(|d| (*d).to_string()));
        self
    }

    /// Sets the unconditional successor.
    #[must_use]
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Adds a conditional successor.
    #[must_use]
    pub fn with_branch(mut self, when: impl Into<String>, next: impl Into<String>) -> Self {
        self.branches.push(BranchRule {
            when: when.into(),
            next: next.into(),
        });
        self
    }

    /// Places the stage in a parallel group.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: StageRetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Sets the signal deadline.
    #[must_use]
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Sets the guard.
    #[must_use]
    pub fn with_guard(mut self, when: impl Into<String>) -> Self {
        self.when = Some(when.into());
        self
    }

    /// The invocation timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The signal deadline, if any.
    #[must_use]
    pub fn callback_timeout(&self) -> Option<Duration> {
        self.callback_timeout_secs.map(Duration::from_secs)
    }
}

/// The ordered stage list of a campaign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Stages in declared order.
    pub stages: Vec<StageConfig>,
}

impl PipelineDefinition {
    /// Creates a definition.
    #[must_use]
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self { stages }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if there are no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Position of a stage by id.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    /// Stage ids in declared order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }

    /// The step starting at `index`: the whole parallel group the stage
    /// belongs to, or just the stage.
    #[must_use]
    pub fn step_at(&self, index: usize) -> Range<usize> {
        let Some(stage) = self.stages.get(index) else {
            return index..index;
        };
        let Some(group) = stage.parallel_group.as_deref() else {
            return index..index + 1;
        };
        let in_group = |i: usize| self.stages[i].parallel_group.as_deref() == Some(group);
        let mut start = index;
        while start > 0 && in_group(start - 1) {
            start -= 1;
        }
        let mut end = index + 1;
        while end < self.stages.len() && in_group(end) {
            end += 1;
        }
        start..end
    }

    /// Resolves the stage that follows `index` given its output.
    ///
    /// Branches are evaluated in order against `output`; the first match
    /// wins, then the unconditional `next`, then declared order. Returns
    /// `None` past the last stage.
    ///
    /// # Errors
    ///
    /// Fails on malformed conditions or unknown targets (both rejected by
    /// [`PipelineDefinition::validate`]).
    pub fn next_after(
        &self,
        index: usize,
        output: &serde_json::Value,
    ) -> Result<Option<usize>, PipelineValidationError> {
        let Some(stage) = self.stages.get(index) else {
            return Ok(None);
        };

        for rule in &stage.branches {
            if routing::evaluate(&rule.when, output)? {
                return self.resolve_target(&stage.id, &rule.next).map(Some);
            }
        }
        if let Some(next) = &stage.next {
            return self.resolve_target(&stage.id, next).map(Some);
        }

        let next = self.step_at(index).end;
        Ok((next < self.stages.len()).then_some(next))
    }

    fn resolve_target(&self, from: &str, target: &str) -> Result<usize, PipelineValidationError> {
        self.index_of(target).ok_or_else(|| {
            route_error(from, target, format!("Stage '{from}' routes to unknown stage '{target}'"))
        })
    }

    /// Validates the definition on its own (without a registry).
    ///
    /// # Errors
    ///
    /// Returns the first problem found, with a diagnostic code.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").with_error_info(
                ErrorInfo::new("PIPELINE-EMPTY", "Cannot run an empty pipeline")
                    .with_fix_hint("Add at least one stage to the campaign pipeline."),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() || stage.capability.trim().is_empty() {
                return Err(PipelineValidationError::new(
                    "Stage id and capability must be non-empty",
                )
                .with_stages(vec![stage.id.clone()])
                .with_error_info(ErrorInfo::new("PIPELINE-STAGE", "Stage is missing an id or capability")));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(PipelineValidationError::new(format!("Duplicate stage id '{}'", stage.id))
                    .with_stages(vec![stage.id.clone()])
                    .with_error_info(
                        ErrorInfo::new("PIPELINE-DUPLICATE", format!("Stage '{}' is declared twice", stage.id))
                            .with_fix_hint("Rename one of the stages."),
                    ));
            }
        }

        for (index, stage) in self.stages.iter().enumerate() {
            self.validate_stage(index, stage)?;
        }

        self.validate_groups()?;

        if let Some(cycle) = find_cycle(&self.stages) {
            return Err(PipelineValidationError::cycle(cycle));
        }
        Ok(())
    }

    fn validate_stage(&self, index: usize, stage: &StageConfig) -> Result<(), PipelineValidationError> {
        for dep in &stage.dependencies {
            if dep == &stage.id {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' depends on itself",
                    stage.id
                ))
                .with_stages(vec![stage.id.clone()])
                .with_error_info(ErrorInfo::new("PIPELINE-SELF-DEP", "A stage cannot depend on itself")));
            }
            if self.index_of(dep).is_none() {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    stage.id, dep
                ))
                .with_stages(vec![stage.id.clone(), dep.clone()])
                .with_error_info(
                    ErrorInfo::new("PIPELINE-MISSING-DEP", format!("Dependency '{dep}' not found"))
                        .with_fix_hint("Declare the dependency as a stage of the same pipeline."),
                ));
            }
        }

        let targets = stage
            .next
            .iter()
            .chain(stage.branches.iter().map(|b| &b.next));
        for target in targets {
            match self.index_of(target) {
                None => {
                    return Err(route_error(
                        &stage.id,
                        target,
                        format!("Stage '{}' routes to unknown stage '{target}'", stage.id),
                    ))
                }
                Some(to) if to <= index => {
                    return Err(route_error(
                        &stage.id,
                        target,
                        format!("Stage '{}' routes backwards to '{target}'", stage.id),
                    ))
                }
                Some(_) => {}
            }
        }

        let conditions = stage
            .when
            .iter()
            .chain(stage.branches.iter().map(|b| &b.when));
        for expr in conditions {
            Condition::parse(expr).map_err(|err| err.with_stages(vec![stage.id.clone()]))?;
        }
        Ok(())
    }

    fn validate_groups(&self) -> Result<(), PipelineValidationError> {
        let mut closed: HashSet<&str> = HashSet::new();
        let mut index = 0;
        while index < self.stages.len() {
            let step = self.step_at(index);
            if let Some(group) = self.stages[index].parallel_group.as_deref() {
                if !closed.insert(group) {
                    return Err(group_error(group, format!("Parallel group '{group}' is not contiguous")));
                }
                let members = &self.stages[step.clone()];
                let ids: HashSet<&str> = members.iter().map(|s| s.id.as_str()).collect();
                for member in members {
                    if member.next.is_some() || !member.branches.is_empty() {
                        return Err(group_error(
                            group,
                            format!("Stage '{}' in parallel group '{group}' cannot route", member.id),
                        ));
                    }
                    if member.dependencies.iter().any(|d| ids.contains(d.as_str())) {
                        return Err(group_error(
                            group,
                            format!("Stage '{}' depends on a member of its own parallel group", member.id),
                        ));
                    }
                }
            }
            index = step.end;
        }
        Ok(())
    }
}

fn route_error(from: &str, target: &str, message: String) -> PipelineValidationError {
    PipelineValidationError::new(message)
        .with_stages(vec![from.to_string(), target.to_string()])
        .with_error_info(
            ErrorInfo::new("PIPELINE-ROUTE", "Invalid routing target")
                .with_fix_hint("Route only to stages declared later in the pipeline."),
        )
}

fn group_error(group: &str, message: String) -> PipelineValidationError {
    PipelineValidationError::new(message).with_error_info(
        ErrorInfo::new("PIPELINE-GROUP", "Invalid parallel group").with_context_entry("group", group),
    )
}
