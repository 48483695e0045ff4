//! Step graph construction, validation and frontier computation.
//!
//! Uses `petgraph` to model `after` dependencies as a directed graph.
//! Topological sort rejects cycles; loop steps re-enter themselves through
//! their `LoopSpec` and never appear as edges. Readiness is computed against
//! the execution context each time the engine advances.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use trellis_types::workflow::{ErrorKind, StepStatus};

use super::context::ExecutionContext;
use super::step::Step;

/// Step ids that would shadow a variable reference root.
const RESERVED_IDS: &[&str] = &["trigger", "variables"];

// ---------------------------------------------------------------------------
// GraphError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("workflow has no steps")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("invalid step id '{0}': ids must be non-empty, must not contain '.', and must not be 'trigger' or 'variables'")]
    InvalidStepId(String),

    #[error("cycle detected involving step '{0}'")]
    Cycle(String),
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Cycle(_) => ErrorKind::CyclicGraph,
            _ => ErrorKind::Validation,
        }
    }
}

// ---------------------------------------------------------------------------
// StepGraph
// ---------------------------------------------------------------------------

/// Immutable, validated DAG of steps in registration order.
///
/// A step depends on its `after` set plus every step its condition reads.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    /// Effective dependencies per step, by position.
    requires: Vec<Vec<String>>,
    /// Dependencies whose failure the step's own condition handles.
    absorbs: Vec<HashSet<String>>,
    dependents: HashMap<String, Vec<String>>,
    /// Steps whose failure some dependent's condition checks for.
    absorbed: HashSet<String>,
}

impl StepGraph {
    pub fn new(steps: Vec<Step>) -> Result<Self, GraphError> {
        if steps.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.id.is_empty() || step.id.contains('.') || RESERVED_IDS.contains(&step.id.as_str()) {
                return Err(GraphError::InvalidStepId(step.id.clone()));
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
        }

        let mut requires = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut deps = Vec::with_capacity(step.after.len());
            for dep in &step.after {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            // Steps outside this graph (or the step itself) resolve to absent values.
            if let Some(condition) = &step.condition {
                for referenced in condition.referenced_steps() {
                    if referenced != step.id && index.contains_key(&referenced) && !deps.contains(&referenced) {
                        deps.push(referenced);
                    }
                }
            }
            requires.push(deps);
        }

        // Edge from dependency -> dependent
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            for dep in &requires[i] {
                graph.add_edge(nodes[index[dep]], nodes[i], ());
                dependents.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }

        toposort(&graph, None).map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].to_string()))?;

        let absorbs: Vec<HashSet<String>> = steps
            .iter()
            .zip(&requires)
            .map(|(step, deps)| {
                step.condition
                    .as_ref()
                    .map(|c| {
                        c.checks_failure_of()
                            .into_iter()
                            .filter(|id| deps.contains(id))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();
        let absorbed = absorbs.iter().flatten().cloned().collect();

        Ok(Self {
            steps,
            index,
            requires,
            absorbs,
            dependents,
            absorbed,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, step_id: &str) -> Option<&Step> {
        self.index.get(step_id).map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Effective dependencies of a step: `after` plus condition references.
    pub fn requires(&self, step_id: &str) -> &[String] {
        self.index
            .get(step_id)
            .map(|&i| self.requires[i].as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.dependents
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether a failure of `step_id` leaves the run able to complete.
    pub fn failure_tolerated(&self, step_id: &str) -> bool {
        self.absorbed.contains(step_id) || self.continues_on_failure(step_id)
    }

    fn continues_on_failure(&self, step_id: &str) -> bool {
        self.get(step_id).is_some_and(|s| s.continue_on_failure)
    }

    /// A step is ready when it is pending and every dependency is settled
    /// in a way that satisfies it. A failed dependency only satisfies a step
    /// whose condition checks for that failure, unless the failed step
    /// continues on failure.
    pub fn is_ready(&self, step: &Step, ctx: &ExecutionContext) -> bool {
        let Some(&i) = self.index.get(&step.id) else {
            return false;
        };
        ctx.status_of(&step.id) == StepStatus::Pending
            && self.requires[i].iter().all(|dep| {
                let tolerated = self.absorbs[i].contains(dep) || self.continues_on_failure(dep);
                ctx.status_of(dep).satisfies_dependency(tolerated)
            })
    }

    /// Ready steps in registration order.
    pub fn frontier<'a>(&'a self, ctx: &ExecutionContext) -> Vec<&'a Step> {
        self.steps.iter().filter(|s| self.is_ready(s, ctx)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::condition::Condition;
    use crate::workflow::step::{StepInput, StepOutcome};
    use serde_json::json;
    use trellis_types::workflow::StepResult;
    use uuid::Uuid;

    fn noop(id: &str) -> Step {
        Step::new(id, |_input: StepInput| async {
            Ok(StepOutcome::output(json!(null)))
        })
    }

    fn set_status(ctx: &mut ExecutionContext, id: &str, status: StepStatus) {
        ctx.steps.insert(
            id.to_string(),
            StepResult {
                status,
                ..StepResult::default()
            },
        );
    }

    fn diamond() -> StepGraph {
        StepGraph::new(vec![
            noop("a"),
            noop("b").after("a"),
            noop("c").after("a"),
            noop("d").after("b").after("c"),
        ])
        .unwrap()
    }

    #[test]
    fn test_empty_graph_rejected() {
        assert_eq!(StepGraph::new(vec![]).unwrap_err(), GraphError::Empty);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = StepGraph::new(vec![noop("a"), noop("a")]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateStep("a".to_string()));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = StepGraph::new(vec![noop("a").after("ghost")]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn test_invalid_ids_rejected() {
        for id in ["", "a.b", "trigger", "variables"] {
            let err = StepGraph::new(vec![noop(id)]).unwrap_err();
            assert_eq!(err, GraphError::InvalidStepId(id.to_string()));
        }
    }

    #[test]
    fn test_cycle_detected() {
        let err = StepGraph::new(vec![noop("a").after("b"), noop("b").after("a")]).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
        assert_eq!(err.kind(), ErrorKind::CyclicGraph);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = StepGraph::new(vec![noop("a").after("a")]).unwrap_err();
        assert_eq!(err, GraphError::Cycle("a".to_string()));
    }

    #[test]
    fn test_frontier_follows_dependencies() {
        let graph = diamond();
        let mut ctx = ExecutionContext::new("wf", Uuid::now_v7(), json!({}));

        let ids = |ctx: &ExecutionContext| -> Vec<String> {
            graph.frontier(ctx).iter().map(|s| s.id.clone()).collect()
        };
        assert_eq!(ids(&ctx), vec!["a"]);

        set_status(&mut ctx, "a", StepStatus::Success);
        assert_eq!(ids(&ctx), vec!["b", "c"]);

        set_status(&mut ctx, "b", StepStatus::Success);
        set_status(&mut ctx, "c", StepStatus::Running);
        assert!(ids(&ctx).is_empty());

        set_status(&mut ctx, "c", StepStatus::Skipped);
        assert_eq!(ids(&ctx), vec!["d"]);
    }

    #[test]
    fn test_failed_dependency_blocks_unless_tolerated() {
        let graph = StepGraph::new(vec![
            noop("fetch"),
            noop("process").after("fetch"),
            noop("flaky"),
            noop("after_flaky").after("flaky"),
        ])
        .unwrap();
        let mut ctx = ExecutionContext::new("wf", Uuid::now_v7(), json!({}));
        set_status(&mut ctx, "fetch", StepStatus::Failed);
        set_status(&mut ctx, "flaky", StepStatus::Failed);
        assert!(graph.frontier(&ctx).is_empty());

        let graph = StepGraph::new(vec![
            noop("fetch"),
            noop("fallback")
                .after("fetch")
                .when(Condition::status("fetch", StepStatus::Failed)),
            noop("flaky").continue_on_failure(),
            noop("after_flaky").after("flaky"),
        ])
        .unwrap();
        assert!(graph.failure_tolerated("fetch"));
        let ready: Vec<_> = graph.frontier(&ctx).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["fallback", "after_flaky"]);
    }

    #[test]
    fn test_failure_only_releases_the_checking_branch() {
        let graph = StepGraph::new(vec![
            noop("fetch"),
            noop("process").after("fetch"),
            noop("fallback")
                .after("fetch")
                .when(Condition::status("fetch", StepStatus::Failed)),
        ])
        .unwrap();
        let mut ctx = ExecutionContext::new("wf", Uuid::now_v7(), json!({}));
        set_status(&mut ctx, "fetch", StepStatus::Failed);
        assert!(graph.failure_tolerated("fetch"));
        let ready: Vec<_> = graph.frontier(&ctx).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["fallback"]);
    }

    #[test]
    fn test_condition_references_become_dependencies() {
        let graph = StepGraph::new(vec![
            noop("fetch"),
            noop("fallback").when(Condition::compare(
                "steps.fetch.status",
                crate::workflow::condition::CompareOp::Eq,
                json!("failed"),
            )),
        ])
        .unwrap();
        assert_eq!(graph.requires("fallback"), &["fetch".to_string()]);
        assert_eq!(graph.dependents("fetch"), &["fallback".to_string()]);
        assert!(graph.failure_tolerated("fetch"));

        let mut ctx = ExecutionContext::new("wf", Uuid::now_v7(), json!({}));
        let ready = |ctx: &ExecutionContext| -> Vec<String> {
            graph.frontier(ctx).iter().map(|s| s.id.clone()).collect()
        };
        assert_eq!(ready(&ctx), vec!["fetch"]);
        set_status(&mut ctx, "fetch", StepStatus::Running);
        assert!(ready(&ctx).is_empty());
        set_status(&mut ctx, "fetch", StepStatus::Failed);
        assert_eq!(ready(&ctx), vec!["fallback"]);
    }

    #[test]
    fn test_condition_reference_cycle_rejected() {
        let err = StepGraph::new(vec![
            noop("a").when(Condition::status("b", StepStatus::Success)),
            noop("b").after("a"),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn test_dependents() {
        let graph = diamond();
        assert_eq!(graph.dependents("a"), &["b".to_string(), "c".to_string()]);
        assert!(graph.dependents("d").is_empty());
        assert_eq!(graph.requires("d"), &["b".to_string(), "c".to_string()]);
    }
}
