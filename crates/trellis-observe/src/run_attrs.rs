//! Attribute names and log mapping for workflow run telemetry.
//!
//! Spans and events use dotted attribute names so that they line up with
//! OpenTelemetry attribute conventions once exported.

use tracing::Span;
use trellis_types::event::RunEvent;
use uuid::Uuid;

/// Run id attribute, recorded on the run span after it is created.
pub const RUN_ID: &str = "workflow.run.id";

/// Span covering one `start` or `resume` call. The run id is recorded once
/// known via [`record_run_id`].
pub fn run_span(workflow_id: &str) -> Span {
    tracing::info_span!(
        "workflow.run",
        workflow.id = workflow_id,
        workflow.run.id = tracing::field::Empty,
    )
}

pub fn record_run_id(span: &Span, run_id: Uuid) {
    span.record(RUN_ID, tracing::field::display(run_id));
}

/// Emit one structured log line for `event`.
pub fn log_event(event: &RunEvent) {
    match event {
        RunEvent::Started {
            run_id,
            workflow_id,
            resumed,
        } => tracing::info!(workflow.run.id = %run_id, workflow.id = %workflow_id, resumed, "run started"),
        RunEvent::StepStarted {
            run_id,
            step_path,
            attempt,
        } => tracing::debug!(workflow.run.id = %run_id, workflow.step.path = %step_path, workflow.step.attempt = attempt, "step started"),
        RunEvent::StepCompleted {
            run_id,
            step_path,
            duration_ms,
        } => tracing::info!(workflow.run.id = %run_id, workflow.step.path = %step_path, duration_ms, "step completed"),
        RunEvent::StepFailed {
            run_id,
            step_path,
            error,
            will_retry,
        } => tracing::warn!(
            workflow.run.id = %run_id,
            workflow.step.path = %step_path,
            error.kind = %error.kind,
            will_retry,
            "step failed: {}",
            error.message
        ),
        RunEvent::StepSkipped { run_id, step_path } => {
            tracing::info!(workflow.run.id = %run_id, workflow.step.path = %step_path, "step skipped")
        }
        RunEvent::StepSuspended { run_id, step_path, .. } => {
            tracing::info!(workflow.run.id = %run_id, workflow.step.path = %step_path, "step suspended")
        }
        RunEvent::Suspended { run_id, step_path } => {
            tracing::info!(workflow.run.id = %run_id, workflow.step.path = %step_path, "run suspended")
        }
        RunEvent::Completed {
            run_id,
            workflow_id,
            duration_ms,
            ..
        } => tracing::info!(workflow.run.id = %run_id, workflow.id = %workflow_id, duration_ms, "run completed"),
        RunEvent::Failed {
            run_id,
            workflow_id,
            error,
        } => tracing::error!(
            workflow.run.id = %run_id,
            workflow.id = %workflow_id,
            error.kind = %error.kind,
            "run failed: {}",
            error.message
        ),
    }
}
