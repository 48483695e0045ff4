//! Workflow run domain types for Trellis.
//!
//! Status enums for steps and runs, per-step results, retry policy, and the
//! persisted run record. The engine in `trellis-core` owns all mutation of
//! these values; stores only serialize them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step status
// ---------------------------------------------------------------------------

/// Lifecycle status of a single step within a run.
///
/// `pending -> (skipped | running -> (success | failed | suspended))`.
/// Loop steps re-enter `running` from `success`, and a resumed step re-enters
/// `running` from `suspended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Skipped,
    Running,
    Success,
    Failed,
    Suspended,
}

impl StepStatus {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            (Pending, Skipped) | (Pending, Running) => true,
            (Running, Success) | (Running, Failed) | (Running, Suspended) => true,
            // Loop re-entry
            (Success, Running) => true,
            // Resume
            (Suspended, Running) => true,
            (Pending, _) | (Running, _) | (Success, _) | (Suspended, _) => false,
            (Skipped, _) | (Failed, _) => false,
        }
    }

    /// Terminal for the current run attempt. `Suspended` counts: it is
    /// resumable, but nothing else happens to the step until a resume.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped | StepStatus::Suspended
        )
    }

    /// Whether a dependency in this status lets its dependents become ready.
    ///
    /// `failure_tolerated` is true when the failed step is configured to
    /// continue or a failure branch absorbs it.
    pub fn satisfies_dependency(self, failure_tolerated: bool) -> bool {
        match self {
            StepStatus::Success | StepStatus::Skipped => true,
            StepStatus::Failed => failure_tolerated,
            StepStatus::Pending | StepStatus::Running | StepStatus::Suspended => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Skipped => "skipped",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run: `created -> running -> (completed | failed | suspended)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Suspended,
}

impl RunStatus {
    /// Completed and failed runs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(RunStatus::Created),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "suspended" => Ok(RunStatus::Suspended),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Classification of everything that can go wrong in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Step input or output did not match its schema.
    Validation,
    /// The step's own logic returned an error.
    StepExecution,
    /// A condition or loop predicate could not be evaluated.
    ConditionEvaluation,
    /// Resume called against a run or step that is not suspended.
    InvalidResumeTarget,
    Cancelled,
    Timeout,
    /// Graph construction found a cycle outside the loop primitives.
    CyclicGraph,
}

impl ErrorKind {
    /// Only validation and execution failures are offered to a retry policy.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Validation | ErrorKind::StepExecution)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::StepExecution => "step_execution",
            ErrorKind::ConditionEvaluation => "condition_evaluation",
            ErrorKind::InvalidResumeTarget => "invalid_resume_target",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CyclicGraph => "cyclic_graph",
        };
        f.write_str(s)
    }
}

/// A recorded failure: step results and failed runs carry one of these as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Step result
// ---------------------------------------------------------------------------

/// The recorded outcome of a step within a run context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    /// Invocations made for the latest execution (1 + retries).
    #[serde(default)]
    pub attempts: u32,
    /// Completed loop iterations (1 for non-loop steps that ran).
    #[serde(default)]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Payload the step handed over when it requested suspension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_payload: Option<serde_json::Value>,
}

impl StepResult {
    pub fn skipped() -> Self {
        let now = Utc::now();
        Self {
            status: StepStatus::Skipped,
            started_at: Some(now),
            completed_at: Some(now),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Per-step (or per-workflow default) retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-invocations allowed after the first failed try.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Base delay before the first retry.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            attempts,
            delay_ms,
            backoff_multiplier,
        }
    }

    /// Delay before re-invoking after the 1-based failed `attempt`:
    /// `delay_ms * backoff_multiplier^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !millis.is_finite() || millis <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

// ---------------------------------------------------------------------------
// Run record (persisted)
// ---------------------------------------------------------------------------

/// A workflow run as stored by a `RunStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: RunStatus,
    /// JSON snapshot of the execution context (trigger input, step results,
    /// variables, nested contexts).
    pub context: serde_json::Value,
    /// Dotted path of the suspended step, e.g. `review.approve`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_step_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
