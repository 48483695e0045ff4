//! Workflow engine core: graph model, scheduling, and durable run state.
//!
//! - `step`, `graph`, `builder`, `definition` -- step graph construction and validation
//! - `context`, `resolver`, `projection` -- run state, variable resolution, output mapping
//! - `condition`, `expression` -- step conditions and loop predicates
//! - `retry`, `step_runner` -- per-step invocation with schema checks, deadlines, and retries
//! - `scheduler` -- frontier-driven traversal with bounded concurrency and nesting
//! - `checkpoint` -- run records, snapshots, and suspended-step addressing
//! - `engine` -- public run control API

pub mod builder;
pub mod checkpoint;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod projection;
pub mod resolver;
pub mod retry;
mod scheduler;
pub mod schema;
pub mod step;
mod step_runner;

pub use builder::WorkflowBuilder;
pub use checkpoint::{CheckpointError, CheckpointManager, StepPath};
pub use condition::{CompareOp, Condition, ConditionError};
pub use context::{ContextView, ExecutionContext};
pub use definition::{Workflow, WorkflowError};
pub use engine::{Engine, EngineError, RunOptions, RunResult};
pub use graph::{GraphError, StepGraph};
pub use projection::OutputProjection;
pub use schema::{FieldType, Schema, SchemaError};
pub use step::{Step, StepError, StepHandler, StepInput, StepOutcome};
