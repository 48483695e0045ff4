//! Immutable workflow definitions.
//!
//! A `Workflow` is produced by [`WorkflowBuilder`](super::builder::WorkflowBuilder)
//! and registered with the engine. It owns the validated step graph, the
//! output projection, and workflow-wide defaults.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use trellis_types::workflow::{ErrorKind, RetryPolicy};

use super::context::ExecutionContext;
use super::graph::{GraphError, StepGraph};
use super::projection::OutputProjection;

/// Errors raised while building a workflow.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("invalid workflow id '{0}': use letters, digits, '-' or '_'")]
    InvalidId(String),

    #[error("workflow '{workflow}': {source}")]
    Graph {
        workflow: String,
        #[source]
        source: GraphError,
    },

    #[error("workflow '{workflow}': {message}")]
    Builder { workflow: String, message: String },
}

impl WorkflowError {
    /// `CyclicGraph` for cycles, `Validation` for everything else.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Graph { source, .. } => source.kind(),
            _ => ErrorKind::Validation,
        }
    }
}

pub(crate) fn validate_workflow_id(id: &str) -> Result<(), WorkflowError> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub(crate) id: String,
    pub(crate) description: Option<String>,
    pub(crate) graph: StepGraph,
    pub(crate) projection: OutputProjection,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
}

impl Workflow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Retry policy for steps that do not declare their own.
    pub fn default_retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Run deadline overriding the engine default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Project the run output from a finished context.
    pub fn project(&self, ctx: &ExecutionContext) -> Value {
        self.projection.project(&self.graph, ctx)
    }
}
