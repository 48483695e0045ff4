//! Step definitions and the step execution contract.
//!
//! A `Step` is either a simple unit of work backed by a [`StepHandler`] or a
//! composite step that runs a whole nested workflow. Handlers receive their
//! materialized input plus a read-only view of the run context and return
//! output, variable writes, or a request to suspend.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use trellis_types::variable::VariableRef;
use trellis_types::workflow::{ErrorKind, RetryPolicy};

use super::condition::Condition;
use super::context::ContextView;
use super::definition::Workflow;
use super::schema::Schema;

// ---------------------------------------------------------------------------
// Execution contract
// ---------------------------------------------------------------------------

/// Everything a handler sees for one invocation.
#[derive(Debug, Clone)]
pub struct StepInput {
    /// Resolved variables (or the resume payload), defaults applied.
    pub input: Value,
    pub context: ContextView,
    /// 1-based attempt number within the current retry sequence.
    pub attempt: u32,
    /// 1-based loop iteration.
    pub iteration: u32,
    /// Dotted path of this step within the run.
    pub step_path: String,
    /// True when `input` is the payload passed to `resume`.
    pub resumed: bool,
}

impl StepInput {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.input.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.input.get(field).and_then(Value::as_str)
    }
}

/// What a step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Output {
        value: Value,
        /// Writes to the run's variables, applied by the engine.
        variables: Map<String, Value>,
    },
    /// Pause the run until `resume` targets this step.
    Suspend(Option<Value>),
}

impl StepOutcome {
    pub fn output(value: Value) -> Self {
        StepOutcome::Output {
            value,
            variables: Map::new(),
        }
    }

    pub fn suspend(payload: Value) -> Self {
        StepOutcome::Suspend(Some(payload))
    }

    /// Attach a variable write to an `Output` outcome.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        if let StepOutcome::Output { variables, .. } = &mut self {
            variables.insert(name.into(), value);
        }
        self
    }
}

/// Errors a handler may return. Both kinds are offered to the retry policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Failed(_) => ErrorKind::StepExecution,
            StepError::Validation(_) => ErrorKind::Validation,
        }
    }
}

pub type StepFuture = Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send>>;

/// The execute function of a simple step.
pub trait StepHandler: Send + Sync + 'static {
    fn execute(&self, input: StepInput) -> StepFuture;
}

impl<F, Fut> StepHandler for F
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
{
    fn execute(&self, input: StepInput) -> StepFuture {
        Box::pin(self(input))
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// Repeat until the predicate holds.
    Until,
    /// Repeat while the predicate holds.
    While,
}

/// Re-entry rule of a loop step. The predicate is checked after every
/// successful iteration.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub kind: LoopKind,
    pub predicate: Condition,
}

impl LoopSpec {
    pub fn should_continue(&self, predicate_holds: bool) -> bool {
        match self.kind {
            LoopKind::Until => !predicate_holds,
            LoopKind::While => predicate_holds,
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum StepKind {
    Simple(Arc<dyn StepHandler>),
    Composite(Arc<Workflow>),
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Simple(_) => f.write_str("Simple"),
            StepKind::Composite(wf) => write!(f, "Composite({})", wf.id()),
        }
    }
}

/// A node of the step graph.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub after: Vec<String>,
    pub variables: BTreeMap<String, VariableRef>,
    pub condition: Option<Condition>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub input_schema: Option<Schema>,
    pub output_schema: Option<Schema>,
    pub continue_on_failure: bool,
    pub loop_spec: Option<LoopSpec>,
    /// Overrides the engine-wide loop iteration cap.
    pub max_iterations: Option<u32>,
    pub kind: StepKind,
}

impl Step {
    /// A simple step; closures work as handlers:
    ///
    /// ```ignore
    /// Step::new("greet", |input| async move {
    ///     Ok(StepOutcome::output(json!({"text": "hello"})))
    /// })
    /// ```
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
    {
        Self::with_kind(id.into(), StepKind::Simple(Arc::new(handler)))
    }

    /// A simple step backed by a shared handler object.
    pub fn from_handler(id: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self::with_kind(id.into(), StepKind::Simple(handler))
    }

    /// Use a whole workflow as a step. The step id is the workflow id.
    pub fn workflow(workflow: Workflow) -> Self {
        let id = workflow.id().to_string();
        Self::with_kind(id, StepKind::Composite(Arc::new(workflow)))
    }

    fn with_kind(id: String, kind: StepKind) -> Self {
        Self {
            id,
            after: Vec::new(),
            variables: BTreeMap::new(),
            condition: None,
            retry: None,
            timeout: None,
            input_schema: None,
            output_schema: None,
            continue_on_failure: false,
            loop_spec: None,
            max_iterations: None,
            kind,
        }
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.after.contains(&dependency) {
            self.after.push(dependency);
        }
        self
    }

    /// Bind input field `name` to `reference`.
    pub fn variable(mut self, name: impl Into<String>, reference: VariableRef) -> Self {
        self.variables.insert(name.into(), reference);
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Only meaningful for steps added with `until` or `while_`.
    pub fn max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub(crate) fn looping(mut self, kind: LoopKind, predicate: Condition) -> Self {
        self.loop_spec = Some(LoopSpec { kind, predicate });
        self
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, StepKind::Composite(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    use crate::workflow::context::ExecutionContext;

    fn test_input(input: Value) -> StepInput {
        let ctx = ExecutionContext::new("wf", Uuid::now_v7(), json!({}));
        StepInput {
            input,
            context: ContextView::snapshot(&ctx),
            attempt: 1,
            iteration: 1,
            step_path: "echo".to_string(),
            resumed: false,
        }
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let step = Step::new("echo", |input: StepInput| async move {
            Ok(StepOutcome::output(input.input.clone()).with_variable("seen", json!(true)))
        });
        let StepKind::Simple(handler) = &step.kind else {
            panic!("expected a simple step");
        };
        let outcome = handler.execute(test_input(json!({"x": 1}))).await.unwrap();
        match outcome {
            StepOutcome::Output { value, variables } => {
                assert_eq!(value, json!({"x": 1}));
                assert_eq!(variables["seen"], json!(true));
            }
            StepOutcome::Suspend(_) => panic!("unexpected suspend"),
        }
    }

    #[test]
    fn test_builder_methods() {
        let step = Step::new("write", |_input: StepInput| async {
            Ok(StepOutcome::output(json!(null)))
        })
        .after("research")
        .after("research")
        .variable("topic", VariableRef::trigger("topic"))
        .timeout(Duration::from_secs(5))
        .continue_on_failure();

        assert_eq!(step.after, vec!["research"]);
        assert!(step.variables.contains_key("topic"));
        assert!(step.continue_on_failure);
        assert!(!step.is_composite());
    }

    #[test]
    fn test_loop_continuation() {
        let until = LoopSpec {
            kind: LoopKind::Until,
            predicate: Condition::expression("true"),
        };
        assert!(until.should_continue(false));
        assert!(!until.should_continue(true));

        let while_ = LoopSpec {
            kind: LoopKind::While,
            ..until
        };
        assert!(while_.should_continue(true));
        assert!(!while_.should_continue(false));
    }

    #[test]
    fn test_step_error_kinds() {
        assert_eq!(StepError::failed("x").kind(), ErrorKind::StepExecution);
        assert_eq!(StepError::Validation("y".into()).kind(), ErrorKind::Validation);
    }
}
