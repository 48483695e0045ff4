//! Run status events for the Trellis event bus.
//!
//! `RunEvent` is broadcast by the engine while a run progresses. All variants
//! are Clone + Send + Sync for use with tokio broadcast channels. Step paths
//! are dotted for steps inside nested workflows (`review.approve`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::Failure;

/// Events emitted during a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run has started (or resumed).
    Started {
        run_id: Uuid,
        workflow_id: String,
        resumed: bool,
    },

    /// A step invocation has started. `attempt` is 1-based.
    StepStarted {
        run_id: Uuid,
        step_path: String,
        attempt: u32,
    },

    /// A step produced output.
    StepCompleted {
        run_id: Uuid,
        step_path: String,
        duration_ms: u64,
    },

    /// A step invocation failed.
    StepFailed {
        run_id: Uuid,
        step_path: String,
        error: Failure,
        will_retry: bool,
    },

    /// A step's condition evaluated to false.
    StepSkipped { run_id: Uuid, step_path: String },

    /// A step requested suspension.
    StepSuspended {
        run_id: Uuid,
        step_path: String,
        payload: Option<serde_json::Value>,
    },

    /// The run is suspended awaiting `resume`.
    Suspended { run_id: Uuid, step_path: String },

    /// The run completed.
    Completed {
        run_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        output: serde_json::Value,
    },

    /// The run failed.
    Failed {
        run_id: Uuid,
        workflow_id: String,
        error: Failure,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::StepSkipped { run_id, .. }
            | RunEvent::StepSuspended { run_id, .. }
            | RunEvent::Suspended { run_id, .. }
            | RunEvent::Completed { run_id, .. }
            | RunEvent::Failed { run_id, .. } => *run_id,
        }
    }

    /// The last event of a run attempt: completed, failed, or suspended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Completed { .. } | RunEvent::Failed { .. } | RunEvent::Suspended { .. }
        )
    }
}
