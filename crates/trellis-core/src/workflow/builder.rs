//! Fluent workflow construction.
//!
//! ```ignore
//! let wf = WorkflowBuilder::new("article")
//!     .step(research)
//!     .then(writing)
//!     .output("article", VariableRef::step("writing", "text"))
//!     .build()?;
//! ```
//!
//! `step` adds a node with no implicit dependency, `then` depends on the
//! previously added node(s), and `after([..])` sets an explicit barrier for
//! the next added node.

use std::time::Duration;

use serde_json::Value;
use trellis_types::variable::VariableRef;
use trellis_types::workflow::RetryPolicy;

use super::condition::Condition;
use super::definition::{validate_workflow_id, Workflow, WorkflowError};
use super::graph::StepGraph;
use super::projection::OutputProjection;
use super::step::{LoopKind, Step};

pub struct WorkflowBuilder {
    id: String,
    description: Option<String>,
    steps: Vec<Step>,
    /// Ids the next `then` depends on.
    last: Vec<String>,
    /// Barrier set by `after`, consumed by the next added node.
    barrier: Option<Vec<String>>,
    projection: OutputProjection,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            steps: Vec::new(),
            last: Vec::new(),
            barrier: None,
            projection: OutputProjection::default(),
            retry: None,
            timeout: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a step that depends only on a pending `after` barrier (if any).
    pub fn step(mut self, step: Step) -> Self {
        let deps = self.barrier.take().unwrap_or_default();
        self.push(step, deps);
        self
    }

    /// Add a step that runs after the previously added node(s).
    pub fn then(mut self, step: Step) -> Self {
        let deps = self.sequential_deps();
        self.push(step, deps);
        self
    }

    /// Add several steps that all run after the previously added node(s).
    /// The next `then` waits for all of them.
    pub fn parallel(mut self, steps: Vec<Step>) -> Self {
        let deps = self.sequential_deps();
        let mut added = Vec::with_capacity(steps.len());
        for step in steps {
            added.push(step.id.clone());
            self.push(step, deps.clone());
        }
        self.last = added;
        self
    }

    /// The next added step depends on every id in `ids`.
    pub fn after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.barrier = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Two branches gated by `condition` and its negation. The next `then`
    /// waits for both; the skipped branch does not block it.
    pub fn if_else(mut self, condition: Condition, then_branch: Step, else_branch: Step) -> Self {
        let deps = self.sequential_deps();
        let then_id = then_branch.id.clone();
        let else_id = else_branch.id.clone();

        let then_branch = gate(then_branch, condition.clone());
        let else_branch = gate(else_branch, condition.negate());
        self.push(then_branch, deps.clone());
        self.push(else_branch, deps);
        self.last = vec![then_id, else_id];
        self
    }

    /// Re-run `step` after each successful iteration until `predicate` holds.
    pub fn until(self, step: Step, predicate: Condition) -> Self {
        self.then(step.looping(LoopKind::Until, predicate))
    }

    /// Re-run `step` after each successful iteration while `predicate` holds.
    pub fn while_(self, step: Step, predicate: Condition) -> Self {
        self.then(step.looping(LoopKind::While, predicate))
    }

    /// Declare an output field taken from `source`.
    pub fn output(mut self, name: impl Into<String>, source: VariableRef) -> Self {
        self.projection.field(name, source);
        self
    }

    /// Declare an output field computed from `source`.
    pub fn output_with<F>(mut self, name: impl Into<String>, source: VariableRef, transform: F) -> Self
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        self.projection.field_with(name, source, transform);
        self
    }

    /// Retry policy for steps that do not declare one.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        validate_workflow_id(&self.id)?;
        if let Some(barrier) = &self.barrier {
            return Err(WorkflowError::Builder {
                workflow: self.id.clone(),
                message: format!("after({}) is not followed by a step", barrier.join(", ")),
            });
        }

        let graph = StepGraph::new(self.steps).map_err(|source| WorkflowError::Graph {
            workflow: self.id.clone(),
            source,
        })?;

        tracing::debug!(
            workflow_id = %self.id,
            steps = graph.len(),
            "workflow built"
        );

        Ok(Workflow {
            id: self.id,
            description: self.description,
            graph,
            projection: self.projection,
            retry: self.retry,
            timeout: self.timeout,
        })
    }

    fn sequential_deps(&mut self) -> Vec<String> {
        self.barrier.take().unwrap_or_else(|| self.last.clone())
    }

    fn push(&mut self, mut step: Step, deps: Vec<String>) {
        for dep in deps {
            step = step.after(dep);
        }
        self.last = vec![step.id.clone()];
        self.steps.push(step);
    }
}

fn gate(step: Step, condition: Condition) -> Step {
    let combined = match step.condition.clone() {
        Some(existing) => existing.and(condition),
        None => condition,
    };
    step.when(combined)
}
