//! Durable run checkpoints and suspended-step addressing.
//!
//! `CheckpointManager` wraps a `RunStore` and persists the run record with a
//! full context snapshot after every step transition. It also knows how to
//! find suspended steps inside a snapshot, descending through nested
//! workflows, so that `resume` can validate its target.

use std::fmt;

use chrono::Utc;
use trellis_types::workflow::{Failure, RunRecord, RunStatus, StepStatus};
use uuid::Uuid;

use crate::repository::run::RunStore;

use super::context::ExecutionContext;
use super::definition::Workflow;
use super::step::StepKind;

// ---------------------------------------------------------------------------
// StepPath
// ---------------------------------------------------------------------------

/// Dotted address of a step, e.g. `review.approve` for step `approve` inside
/// the nested workflow step `review`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepPath(Vec<String>);

impl StepPath {
    /// Parse a dotted path. Returns `None` for empty paths or empty segments.
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return None;
        }
        Some(Self(segments))
    }

    pub fn single(step_id: impl Into<String>) -> Self {
        Self(vec![step_id.into()])
    }

    pub fn head(&self) -> &str {
        &self.0[0]
    }

    /// The path below the first segment, if any.
    pub fn tail(&self) -> Option<StepPath> {
        (self.0.len() > 1).then(|| Self(self.0[1..].to_vec()))
    }

    /// `prefix.self`
    pub fn prefixed(&self, prefix: &str) -> StepPath {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.push(prefix.to_string());
        segments.extend(self.0.iter().cloned());
        Self(segments)
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Suspended leaf steps of `ctx`, in registration order, descending into
/// suspended nested workflows.
pub fn suspended_paths(workflow: &Workflow, ctx: &ExecutionContext) -> Vec<StepPath> {
    let mut paths = Vec::new();
    for step in workflow.graph().steps() {
        if ctx.status_of(&step.id) != StepStatus::Suspended {
            continue;
        }
        match (&step.kind, ctx.children.get(&step.id)) {
            (StepKind::Composite(inner), Some(child)) => {
                paths.extend(
                    suspended_paths(inner, child)
                        .into_iter()
                        .map(|p| p.prefixed(&step.id)),
                );
            }
            _ => paths.push(StepPath::single(step.id.clone())),
        }
    }
    paths
}

/// Check that `path` names a simple step that is suspended in `ctx`.
/// Returns the reason when it does not.
pub fn locate_suspended(workflow: &Workflow, ctx: &ExecutionContext, path: &StepPath) -> Result<(), String> {
    let head = path.head();
    let step = workflow
        .graph()
        .get(head)
        .ok_or_else(|| format!("workflow '{}' has no step '{head}'", workflow.id()))?;

    let status = ctx.status_of(head);
    if status != StepStatus::Suspended {
        return Err(format!("step '{head}' is {status}, not suspended"));
    }

    match (&step.kind, path.tail()) {
        (StepKind::Composite(inner), Some(rest)) => {
            let child = ctx
                .children
                .get(head)
                .ok_or_else(|| format!("no snapshot for nested workflow '{head}'"))?;
            locate_suspended(inner, child, &rest)
                .map_err(|reason| format!("{head}: {reason}"))
        }
        (StepKind::Composite(_), None) => Err(format!(
            "step '{head}' is a nested workflow; name the suspended step inside it"
        )),
        (StepKind::Simple(_), Some(_)) => Err(format!("step '{head}' has no nested steps")),
        (StepKind::Simple(_), None) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists run records through any `RunStore` backend.
pub struct CheckpointManager<R: RunStore> {
    repo: R,
}

impl<R: RunStore> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Create the record for a new run in status `created`.
    pub async fn create_run(&self, ctx: &ExecutionContext) -> Result<RunRecord, CheckpointError> {
        let now = Utc::now();
        let record = RunRecord {
            run_id: ctx.run_id,
            workflow_id: ctx.workflow_id.clone(),
            status: RunStatus::Created,
            context: ctx.to_json(),
            suspended_step_path: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.repo
            .put_run(&record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(run_id = %record.run_id, workflow_id = %record.workflow_id, "created run record");
        Ok(record)
    }

    /// Write the current snapshot and status.
    pub async fn save(
        &self,
        record: &mut RunRecord,
        ctx: &ExecutionContext,
        status: RunStatus,
        suspended_step_path: Option<String>,
        error: Option<Failure>,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        record.status = status;
        record.context = ctx.to_json();
        record.suspended_step_path = suspended_step_path;
        record.error = error;
        record.updated_at = now;
        record.completed_at = status.is_terminal().then_some(now);

        self.repo
            .put_run(record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(run_id = %record.run_id, status = %status, "checkpointed run");
        Ok(())
    }

    pub async fn load(&self, run_id: Uuid) -> Result<RunRecord, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn find(&self, run_id: Uuid) -> Result<Option<RunRecord>, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Rebuild the execution context stored in a record.
    pub fn restore_context(record: &RunRecord) -> Result<ExecutionContext, CheckpointError> {
        ExecutionContext::from_json(record.context.clone())
            .map_err(|e| CheckpointError::Snapshot(e.to_string()))
    }

    pub async fn list(
        &self,
        workflow_id: Option<&str>,
        status: Option<RunStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        let runs = match (workflow_id, status) {
            (Some(workflow_id), Some(status)) => self
                .repo
                .list_runs_by_workflow(workflow_id, None)
                .await
                .map(|runs| {
                    let mut runs: Vec<_> = runs.into_iter().filter(|r| r.status == status).collect();
                    if let Some(limit) = limit {
                        runs.truncate(limit as usize);
                    }
                    runs
                }),
            (Some(workflow_id), None) => self.repo.list_runs_by_workflow(workflow_id, limit).await,
            (None, Some(status)) => self.repo.list_runs_by_status(status, limit).await,
            (None, None) => self.repo.list_runs(limit).await,
        };
        runs.map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Delete a run record. Returns `true` if it existed.
    pub async fn purge(&self, run_id: Uuid) -> Result<bool, CheckpointError> {
        let deleted = self
            .repo
            .delete_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run_id, deleted, "purged run");
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
