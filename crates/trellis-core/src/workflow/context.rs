//! Run-scoped execution context with step result tracking.
//!
//! `ExecutionContext` is the state that flows through a workflow run: the
//! immutable trigger input, one `StepResult` per step, free-form variables,
//! and the contexts of nested workflows. The engine is its only writer; steps
//! see a read-only [`ContextView`] snapshot.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use trellis_types::workflow::{ErrorKind, Failure, StepResult, StepStatus};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// ContextError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("step '{step_id}' cannot move from {from} to {to}")]
    IllegalTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("failed to restore context: {0}")]
    Restore(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state of one workflow run (or of one nested workflow inside it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    /// Input the run was started with. Never modified.
    pub trigger_input: Value,
    #[serde(default)]
    pub steps: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Contexts of composite steps, keyed by the composite step id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, ExecutionContext>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid, trigger_input: Value) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            trigger_input,
            steps: BTreeMap::new(),
            variables: Map::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(step_id)
    }

    /// Status of a step; steps never touched are `Pending`.
    pub fn status_of(&self, step_id: &str) -> StepStatus {
        self.steps
            .get(step_id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|r| r.output.as_ref())
    }

    fn transition(&mut self, step_id: &str, to: StepStatus) -> Result<&mut StepResult, ContextError> {
        let entry = self.steps.entry(step_id.to_string()).or_default();
        if !entry.status.can_transition_to(to) {
            return Err(ContextError::IllegalTransition {
                step_id: step_id.to_string(),
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        Ok(entry)
    }

    /// Mark a step `running`. The previous output (if any) stays visible
    /// until the new result replaces it.
    pub fn begin_step(&mut self, step_id: &str) -> Result<(), ContextError> {
        let entry = self.transition(step_id, StepStatus::Running)?;
        entry.started_at = Some(Utc::now());
        entry.completed_at = None;
        entry.error = None;
        entry.suspend_payload = None;
        Ok(())
    }

    /// Mark a pending step `skipped`.
    pub fn skip_step(&mut self, step_id: &str) -> Result<(), ContextError> {
        self.transition(step_id, StepStatus::Skipped)?;
        self.steps.insert(step_id.to_string(), StepResult::skipped());
        Ok(())
    }

    /// Replace a running step's result with its outcome.
    ///
    /// Outputs over `MAX_STEP_OUTPUT_SIZE` are replaced with a truncation
    /// marker. If the context then exceeds `MAX_CONTEXT_SIZE`, the step is
    /// recorded as failed instead.
    pub fn finish_step(&mut self, step_id: &str, mut result: StepResult) -> Result<(), ContextError> {
        self.transition(step_id, result.status)?;

        if let Some(output) = result.output.take() {
            result.output = Some(truncate_output(step_id, output));
        }
        self.steps.insert(step_id.to_string(), result);

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            tracing::warn!(step_id, total, max = MAX_CONTEXT_SIZE, "context size limit exceeded");
            if let Some(entry) = self.steps.get_mut(step_id) {
                entry.status = StepStatus::Failed;
                entry.output = None;
                entry.error = Some(Failure::new(
                    ErrorKind::StepExecution,
                    format!("total context size ({total} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"),
                ));
            }
        }
        Ok(())
    }

    /// Merge variable writes returned by a step.
    pub fn apply_variables(&mut self, writes: Map<String, Value>) {
        for (key, value) in writes {
            self.variables.insert(key, value);
        }
    }

    /// Compute the total serialized size of all context data in bytes.
    pub fn total_size(&self) -> usize {
        let size_of = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        let outputs: usize = self
            .steps
            .values()
            .filter_map(|r| r.output.as_ref())
            .map(size_of)
            .sum();
        let variables: usize = self.variables.values().map(size_of).sum();
        let children: usize = self.children.values().map(|c| c.total_size()).sum();
        outputs + variables + children + size_of(&self.trigger_input)
    }

    /// Serialize the entire context to JSON for checkpointing.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Restore a context from a JSON checkpoint.
    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        serde_json::from_value(value).map_err(|e| ContextError::Restore(e.to_string()))
    }

    /// Build the JSON object conditions and JEXL expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "steps": { "<step_id>": { "status": "success", "output": <value> }, ... },
    ///   "trigger": <trigger input>,
    ///   "variables": { ... },
    ///   "workflow": { "id": "...", "run_id": "..." }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut steps = Map::new();
        for (id, result) in &self.steps {
            let mut entry = Map::new();
            entry.insert("status".to_string(), json!(result.status.as_str()));
            entry.insert(
                "output".to_string(),
                result.output.clone().unwrap_or(Value::Null),
            );
            if let Some(err) = &result.error {
                entry.insert("error".to_string(), json!(err.message));
            }
            steps.insert(id.clone(), Value::Object(entry));
        }

        json!({
            "steps": steps,
            "trigger": self.trigger_input,
            "variables": self.variables,
            "workflow": {
                "id": self.workflow_id,
                "run_id": self.run_id.to_string(),
            }
        })
    }
}

fn truncate_output(step_id: &str, output: Value) -> Value {
    let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return output;
    }
    tracing::warn!(
        step_id,
        size,
        max = MAX_STEP_OUTPUT_SIZE,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
    })
}

// ---------------------------------------------------------------------------
// ContextView
// ---------------------------------------------------------------------------

/// Read-only snapshot of a context handed to executing steps.
#[derive(Debug, Clone)]
pub struct ContextView(Arc<ExecutionContext>);

impl ContextView {
    pub fn snapshot(ctx: &ExecutionContext) -> Self {
        Self(Arc::new(ctx.clone()))
    }
}

impl Deref for ContextView {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ExecutionContext {
        ExecutionContext::new("digest", Uuid::now_v7(), json!({ "topic": "AI" }))
    }

    fn success(output: Value) -> StepResult {
        StepResult {
            status: StepStatus::Success,
            output: Some(output),
            attempts: 1,
            iterations: 1,
            completed_at: Some(Utc::now()),
            ..StepResult::default()
        }
    }

    #[test]
    fn test_untouched_step_is_pending() {
        let ctx = test_context();
        assert_eq!(ctx.status_of("gather"), StepStatus::Pending);
        assert!(ctx.output_of("gather").is_none());
    }

    #[test]
    fn test_begin_and_finish_step() {
        let mut ctx = test_context();
        ctx.begin_step("gather").unwrap();
        assert_eq!(ctx.status_of("gather"), StepStatus::Running);
        assert!(ctx.step("gather").unwrap().started_at.is_some());

        ctx.finish_step("gather", success(json!({"text": "news"}))).unwrap();
        assert_eq!(ctx.status_of("gather"), StepStatus::Success);
        assert_eq!(ctx.output_of("gather"), Some(&json!({"text": "news"})));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut ctx = test_context();
        let err = ctx.finish_step("gather", success(json!(1))).unwrap_err();
        assert!(matches!(err, ContextError::IllegalTransition { .. }));

        ctx.skip_step("other").unwrap();
        assert!(ctx.begin_step("other").is_err());
    }

    #[test]
    fn test_loop_reentry_replaces_previous_result() {
        let mut ctx = test_context();
        ctx.begin_step("count").unwrap();
        ctx.finish_step("count", success(json!({"n": 1}))).unwrap();
        ctx.begin_step("count").unwrap();
        // previous output stays visible while the next iteration runs
        assert_eq!(ctx.output_of("count"), Some(&json!({"n": 1})));
        ctx.finish_step("count", success(json!({"n": 2}))).unwrap();
        assert_eq!(ctx.output_of("count"), Some(&json!({"n": 2})));
    }

    #[test]
    fn test_step_output_size_limit_truncates() {
        let mut ctx = test_context();
        let large = "x".repeat(MAX_STEP_OUTPUT_SIZE + 100);
        ctx.begin_step("big").unwrap();
        ctx.finish_step("big", success(json!(large))).unwrap();

        let output = ctx.output_of("big").unwrap();
        assert_eq!(output["_truncated"], json!(true));
        assert_eq!(ctx.status_of("big"), StepStatus::Success);
    }

    #[test]
    fn test_apply_variables_overwrites() {
        let mut ctx = test_context();
        let mut writes = Map::new();
        writes.insert("count".to_string(), json!(1));
        ctx.apply_variables(writes);
        let mut writes = Map::new();
        writes.insert("count".to_string(), json!(2));
        ctx.apply_variables(writes);
        assert_eq!(ctx.variables["count"], json!(2));
    }

    #[test]
    fn test_json_checkpoint_roundtrip() {
        let mut ctx = test_context();
        ctx.begin_step("gather").unwrap();
        ctx.finish_step("gather", success(json!("news"))).unwrap();
        ctx.variables.insert("count".to_string(), json!(42));
        ctx.children
            .insert("nested".to_string(), ExecutionContext::new("nested", ctx.run_id, json!({})));

        let restored = ExecutionContext::from_json(ctx.to_json()).unwrap();
        assert_eq!(restored, ctx);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(ExecutionContext::from_json(json!("nope")).is_err());
    }

    #[test]
    fn test_to_expression_context() {
        let mut ctx = test_context();
        ctx.begin_step("gather").unwrap();
        ctx.finish_step("gather", success(json!("news"))).unwrap();

        let expr = ctx.to_expression_context();
        assert_eq!(expr["steps"]["gather"]["output"], json!("news"));
        assert_eq!(expr["steps"]["gather"]["status"], json!("success"));
        assert_eq!(expr["trigger"]["topic"], json!("AI"));
        assert_eq!(expr["workflow"]["id"], json!("digest"));
    }

    #[test]
    fn test_view_is_a_snapshot() {
        let mut ctx = test_context();
        let view = ContextView::snapshot(&ctx);
        ctx.variables.insert("late".to_string(), json!(true));
        assert!(view.variables.get("late").is_none());
    }
}
