//! Frontier scheduler: drives one workflow graph over an execution context.
//!
//! The scheduler is the single writer of the context. Each pass computes the
//! ready frontier, evaluates conditions, and spawns ready steps onto a
//! `JoinSet`; completions are merged back one at a time, persisted, and the
//! frontier recomputed. Nested workflows run the same loop recursively
//! inside their composite step's task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trellis_types::event::RunEvent;
use trellis_types::workflow::{ErrorKind, Failure, StepResult, StepStatus};
use uuid::Uuid;

use crate::event::EventBus;

use super::checkpoint::{CheckpointError, StepPath};
use super::context::{ContextView, ExecutionContext};
use super::definition::Workflow;
use super::engine::EngineError;
use super::resolver::resolve_all;
use super::retry::RetryHandler;
use super::step::{Step, StepKind};
use super::step_runner::{SimpleReport, SimpleTask};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Run scope
// ---------------------------------------------------------------------------

/// Per-run settings shared by the top-level graph and every nested graph.
#[derive(Clone)]
pub(crate) struct RunScope {
    pub run_id: Uuid,
    /// Caller cancellation.
    pub cancel: CancellationToken,
    /// Child of `cancel`, also cancelled when the run deadline passes.
    pub stop: CancellationToken,
    pub deadline: Instant,
    pub semaphore: Option<Arc<Semaphore>>,
    pub default_step_timeout: Option<Duration>,
    pub max_loop_iterations: u32,
    pub events: EventBus,
}

impl RunScope {
    /// Why dispatch must stop, if it must.
    fn interruption(&self) -> Option<Failure> {
        if self.cancel.is_cancelled() {
            return Some(Failure::new(ErrorKind::Cancelled, "run was cancelled"));
        }
        if Instant::now() >= self.deadline {
            self.stop.cancel();
            return Some(Failure::new(ErrorKind::Timeout, "run deadline exceeded"));
        }
        None
    }
}

/// Receives a snapshot after every transition of the top-level graph.
pub(crate) trait SnapshotSink: Send + Sync {
    fn snapshot<'s>(&'s mut self, ctx: &'s ExecutionContext) -> BoxFuture<'s, Result<(), CheckpointError>>;
}

/// Re-execute a suspended step with caller-supplied input.
#[derive(Debug, Clone)]
pub(crate) struct ResumeDirective {
    pub path: StepPath,
    pub input: Value,
}

/// How a graph traversal ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DriveEnd {
    Completed,
    Suspended,
    Failed(Failure),
}

// ---------------------------------------------------------------------------
// Task reports
// ---------------------------------------------------------------------------

enum TaskReport {
    Simple(SimpleReport),
    Composite {
        step_id: String,
        result: StepResult,
        child: ExecutionContext,
        error: Option<EngineError>,
    },
}

fn step_path(prefix: Option<&str>, step_id: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{step_id}"),
        None => step_id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver<'a> {
    scope: RunScope,
    workflow: Arc<Workflow>,
    ctx: &'a mut ExecutionContext,
    prefix: Option<String>,
    sink: Option<&'a mut dyn SnapshotSink>,
    in_flight: JoinSet<TaskReport>,
    /// Failure that stops further dispatch and fails the graph.
    halted: Option<Failure>,
    /// A step suspended; dispatch stops but in-flight work finishes.
    suspending: bool,
    error: Option<EngineError>,
}

/// Traverse `workflow` until nothing is running and nothing is ready.
pub(crate) fn drive<'a>(
    scope: RunScope,
    workflow: Arc<Workflow>,
    ctx: &'a mut ExecutionContext,
    prefix: Option<String>,
    resume: Option<ResumeDirective>,
    sink: Option<&'a mut dyn SnapshotSink>,
) -> BoxFuture<'a, Result<DriveEnd, EngineError>> {
    Box::pin(async move {
        let mut driver = Driver {
            scope,
            workflow,
            ctx,
            prefix,
            sink,
            in_flight: JoinSet::new(),
            halted: None,
            suspending: false,
            error: None,
        };
        driver.run(resume).await
    })
}

impl Driver<'_> {
    async fn run(&mut self, resume: Option<ResumeDirective>) -> Result<DriveEnd, EngineError> {
        if let Some(directive) = resume {
            self.dispatch_resume(directive).await?;
        }

        loop {
            if self.halted.is_none() {
                self.halted = self.scope.interruption();
            }
            if self.accepting() {
                self.dispatch_ready().await?;
            }

            if self.in_flight.is_empty() {
                break;
            }

            let halted = self.halted.is_some();
            let deadline = self.scope.deadline;
            tokio::select! {
                biased;
                _ = self.scope.cancel.cancelled(), if !halted => {
                    tracing::info!(run_id = %self.scope.run_id, "run cancelled, waiting for in-flight steps");
                    self.halted = Some(Failure::new(ErrorKind::Cancelled, "run was cancelled"));
                }
                _ = tokio::time::sleep_until(deadline), if !halted => {
                    tracing::warn!(run_id = %self.scope.run_id, "run deadline exceeded, waiting for in-flight steps");
                    self.scope.stop.cancel();
                    self.halted = Some(Failure::new(ErrorKind::Timeout, "run deadline exceeded"));
                }
                joined = self.in_flight.join_next() => {
                    match joined {
                        Some(Ok(report)) => self.merge(report).await?,
                        Some(Err(e)) => {
                            tracing::error!(run_id = %self.scope.run_id, error = %e, "step task aborted");
                            self.scope.stop.cancel();
                            self.error.get_or_insert(EngineError::Join(e.to_string()));
                        }
                        None => {}
                    }
                }
            }
        }

        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if let Some(failure) = self.halted.take() {
            return Ok(DriveEnd::Failed(failure));
        }
        let suspended = self
            .workflow
            .graph()
            .steps()
            .iter()
            .any(|s| self.ctx.status_of(&s.id) == StepStatus::Suspended);
        Ok(if suspended {
            DriveEnd::Suspended
        } else {
            DriveEnd::Completed
        })
    }

    fn accepting(&self) -> bool {
        self.halted.is_none() && self.error.is_none() && !self.suspending
    }

    async fn persist(&mut self) -> Result<(), EngineError> {
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.snapshot(self.ctx).await?;
        }
        Ok(())
    }

    fn path_of(&self, step_id: &str) -> String {
        step_path(self.prefix.as_deref(), step_id)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Evaluate conditions and spawn every ready step, in registration order,
    /// until nothing more can start.
    async fn dispatch_ready(&mut self) -> Result<(), EngineError> {
        let workflow = Arc::clone(&self.workflow);
        loop {
            let ready: Vec<Step> = workflow
                .graph()
                .frontier(self.ctx)
                .into_iter()
                .cloned()
                .collect();
            if ready.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for step in ready {
                if let Some(condition) = &step.condition {
                    match condition.evaluate(self.ctx) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.ctx.skip_step(&step.id)?;
                            tracing::debug!(run_id = %self.scope.run_id, step_id = %step.id, "condition false, skipping");
                            self.scope.events.publish(RunEvent::StepSkipped {
                                run_id: self.scope.run_id,
                                step_path: self.path_of(&step.id),
                            });
                            self.persist().await?;
                            progressed = true;
                            continue;
                        }
                        Err(e) => {
                            let step_path = self.path_of(&step.id);
                            tracing::error!(run_id = %self.scope.run_id, step_path = %step_path, error = %e, "condition evaluation failed");
                            self.scope.stop.cancel();
                            self.error = Some(EngineError::ConditionEvaluation {
                                step_path,
                                message: e.to_string(),
                            });
                            return Ok(());
                        }
                    }
                }

                let permit = match self.permit_for(&step).await {
                    Some(permit) => permit,
                    // Concurrency limit reached; wait for a completion.
                    None => return Ok(()),
                };

                self.ctx.begin_step(&step.id)?;
                let input = Value::Object(resolve_all(&step.variables, self.ctx));
                self.spawn(&step, input, false, 1, permit);
                self.persist().await?;
                progressed = true;
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Semaphore permit for a simple step. `Some(None)` means unbounded or a
    /// composite step; `None` means the limit is reached and other work is
    /// in flight.
    fn permit_for(&self, step: &Step) -> impl Future<Output = Option<Option<OwnedSemaphorePermit>>> + Send + use<> {
        let semaphore = match (&self.scope.semaphore, &step.kind) {
            (Some(semaphore), StepKind::Simple(_)) => Some(Arc::clone(semaphore)),
            _ => None,
        };
        let idle = self.in_flight.is_empty();
        async move {
            let Some(semaphore) = semaphore else {
                return Some(None);
            };
            match Arc::clone(&semaphore).try_acquire_owned() {
                Ok(permit) => Some(Some(permit)),
                Err(_) if idle => semaphore.acquire_owned().await.ok().map(Some),
                Err(_) => None,
            }
        }
    }

    async fn dispatch_resume(&mut self, directive: ResumeDirective) -> Result<(), EngineError> {
        let workflow = Arc::clone(&self.workflow);
        let head = directive.path.head().to_string();
        let step = workflow
            .graph()
            .get(&head)
            .cloned()
            .ok_or_else(|| EngineError::InvalidResumeTarget {
                run_id: self.scope.run_id,
                reason: format!("no step '{head}'"),
            })?;
        let iteration = self.ctx.step(&head).map(|r| r.iterations.max(1)).unwrap_or(1);

        tracing::info!(run_id = %self.scope.run_id, step_path = %self.path_of(&head), "resuming step");
        self.ctx.begin_step(&head)?;

        match (&step.kind, directive.path.tail()) {
            (StepKind::Composite(inner), Some(rest)) => {
                let child = self.ctx.children.remove(&head).ok_or_else(|| EngineError::InvalidResumeTarget {
                    run_id: self.scope.run_id,
                    reason: format!("no snapshot for nested workflow '{head}'"),
                })?;
                self.spawn_composite(
                    &step,
                    Arc::clone(inner),
                    child,
                    Some(ResumeDirective {
                        path: rest,
                        input: directive.input,
                    }),
                    iteration,
                );
            }
            _ => {
                let permit = self.permit_for(&step).await.flatten();
                self.spawn(&step, directive.input, true, iteration, permit);
            }
        }
        self.persist().await
    }

    fn spawn(
        &mut self,
        step: &Step,
        input: Value,
        resumed: bool,
        iteration: u32,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        match &step.kind {
            StepKind::Simple(handler) => {
                let task = SimpleTask {
                    run_id: self.scope.run_id,
                    step_id: step.id.clone(),
                    step_path: self.path_of(&step.id),
                    handler: Arc::clone(handler),
                    input,
                    resumed,
                    view: ContextView::snapshot(self.ctx),
                    iteration,
                    policy: RetryHandler::effective_policy(step, &self.workflow).cloned(),
                    timeout: step.timeout.or(self.scope.default_step_timeout),
                    input_schema: step.input_schema.clone(),
                    output_schema: step.output_schema.clone(),
                    events: self.scope.events.clone(),
                    stop: self.scope.stop.clone(),
                };
                self.in_flight.spawn(async move {
                    let _permit = permit;
                    TaskReport::Simple(task.run().await)
                });
            }
            StepKind::Composite(inner) => {
                // Declared variables become the nested trigger; otherwise the
                // nested workflow sees the parent's trigger.
                let trigger = if step.variables.is_empty() {
                    self.ctx.trigger_input.clone()
                } else {
                    input
                };
                let child = ExecutionContext::new(inner.id(), self.scope.run_id, trigger);
                self.spawn_composite(step, Arc::clone(inner), child, None, iteration);
            }
        }
    }

    fn spawn_composite(
        &mut self,
        step: &Step,
        inner: Arc<Workflow>,
        mut child: ExecutionContext,
        resume: Option<ResumeDirective>,
        iteration: u32,
    ) {
        let scope = self.scope.clone();
        let step_id = step.id.clone();
        let path = self.path_of(&step.id);
        let input_schema = step.input_schema.clone();

        self.in_flight.spawn(async move {
            let started_at = Utc::now();
            let clock = std::time::Instant::now();
            scope.events.publish(RunEvent::StepStarted {
                run_id: scope.run_id,
                step_path: path.clone(),
                attempt: 1,
            });

            if let (Some(schema), None) = (&input_schema, &resume) {
                schema.apply_defaults(&mut child.trigger_input);
                if let Err(e) = schema.validate(&child.trigger_input) {
                    let failure = Failure::new(ErrorKind::Validation, format!("input: {e}"));
                    scope.events.publish(RunEvent::StepFailed {
                        run_id: scope.run_id,
                        step_path: path,
                        error: failure.clone(),
                        will_retry: false,
                    });
                    return TaskReport::Composite {
                        step_id,
                        result: composite_result(StepStatus::Failed, None, Some(failure), started_at, iteration),
                        child,
                        error: None,
                    };
                }
            }

            let end = drive(scope.clone(), Arc::clone(&inner), &mut child, Some(path.clone()), resume, None).await;

            let (result, error) = match end {
                Ok(DriveEnd::Completed) => {
                    let output = inner.project(&child);
                    scope.events.publish(RunEvent::StepCompleted {
                        run_id: scope.run_id,
                        step_path: path,
                        duration_ms: clock.elapsed().as_millis() as u64,
                    });
                    (composite_result(StepStatus::Success, Some(output), None, started_at, iteration), None)
                }
                Ok(DriveEnd::Suspended) => (
                    composite_result(StepStatus::Suspended, None, None, started_at, iteration),
                    None,
                ),
                Ok(DriveEnd::Failed(failure)) => {
                    scope.events.publish(RunEvent::StepFailed {
                        run_id: scope.run_id,
                        step_path: path,
                        error: failure.clone(),
                        will_retry: false,
                    });
                    (
                        composite_result(StepStatus::Failed, None, Some(failure), started_at, iteration),
                        None,
                    )
                }
                Err(e) => {
                    let failure = Failure::new(e.kind().unwrap_or(ErrorKind::StepExecution), e.to_string());
                    (
                        composite_result(StepStatus::Failed, None, Some(failure), started_at, iteration),
                        Some(e),
                    )
                }
            };

            TaskReport::Composite {
                step_id,
                result,
                child,
                error,
            }
        });
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    async fn merge(&mut self, report: TaskReport) -> Result<(), EngineError> {
        let (step_id, result, variables) = match report {
            TaskReport::Simple(SimpleReport {
                step_id,
                result,
                variables,
            }) => (step_id, result, variables),
            TaskReport::Composite {
                step_id,
                result,
                child,
                error,
            } => {
                self.ctx.children.insert(step_id.clone(), child);
                if let Some(error) = error {
                    self.scope.stop.cancel();
                    self.error.get_or_insert(error);
                }
                (step_id, result, Map::new())
            }
        };

        let iteration = result.iterations;
        self.ctx.finish_step(&step_id, result)?;
        self.ctx.apply_variables(variables);

        match self.ctx.status_of(&step_id) {
            StepStatus::Success => self.continue_loop(&step_id, iteration).await?,
            StepStatus::Failed => self.on_failure(&step_id),
            StepStatus::Suspended => {
                tracing::debug!(run_id = %self.scope.run_id, step_id = %step_id, "step suspended, draining in-flight steps");
                self.suspending = true;
            }
            _ => {}
        }

        self.persist().await
    }

    fn on_failure(&mut self, step_id: &str) {
        if self.workflow.graph().failure_tolerated(step_id) {
            tracing::debug!(run_id = %self.scope.run_id, step_id, "step failure tolerated");
            return;
        }
        let failure = self
            .ctx
            .step(step_id)
            .and_then(|r| r.error.clone())
            .unwrap_or_else(|| Failure::new(ErrorKind::StepExecution, "step failed"));
        tracing::info!(run_id = %self.scope.run_id, step_id, error = %failure, "step failed, halting dispatch");
        self.halted.get_or_insert(Failure::new(
            failure.kind,
            format!("step '{}' failed: {}", self.path_of(step_id), failure.message),
        ));
    }

    /// Re-enter a loop step whose predicate says continue.
    async fn continue_loop(&mut self, step_id: &str, iteration: u32) -> Result<(), EngineError> {
        let workflow = Arc::clone(&self.workflow);
        let Some(step) = workflow.graph().get(step_id) else {
            return Ok(());
        };
        let Some(spec) = &step.loop_spec else {
            return Ok(());
        };
        if self.halted.is_some() || self.error.is_some() {
            return Ok(());
        }

        let holds = match spec.predicate.evaluate(self.ctx) {
            Ok(holds) => holds,
            Err(e) => {
                self.scope.stop.cancel();
                self.error = Some(EngineError::ConditionEvaluation {
                    step_path: self.path_of(step_id),
                    message: e.to_string(),
                });
                return Ok(());
            }
        };
        if !spec.should_continue(holds) {
            tracing::debug!(run_id = %self.scope.run_id, step_id, iterations = iteration, "loop finished");
            return Ok(());
        }

        let max = step.max_iterations.unwrap_or(self.scope.max_loop_iterations);
        self.ctx.begin_step(step_id)?;
        if iteration >= max {
            let failure = Failure::new(
                ErrorKind::StepExecution,
                format!("loop did not finish within {max} iterations"),
            );
            tracing::warn!(run_id = %self.scope.run_id, step_id, max, "loop iteration limit reached");
            self.ctx.finish_step(
                step_id,
                StepResult {
                    status: StepStatus::Failed,
                    error: Some(failure),
                    iterations: iteration,
                    completed_at: Some(Utc::now()),
                    ..StepResult::default()
                },
            )?;
            self.on_failure(step_id);
            return Ok(());
        }

        let permit = match (&self.scope.semaphore, &step.kind) {
            (Some(semaphore), StepKind::Simple(_)) => Arc::clone(semaphore).acquire_owned().await.ok(),
            _ => None,
        };
        let input = Value::Object(resolve_all(&step.variables, self.ctx));
        tracing::debug!(run_id = %self.scope.run_id, step_id, iteration = iteration + 1, "loop re-entry");
        self.spawn(step, input, false, iteration + 1, permit);
        Ok(())
    }
}

fn composite_result(
    status: StepStatus,
    output: Option<Value>,
    error: Option<Failure>,
    started_at: chrono::DateTime<Utc>,
    iteration: u32,
) -> StepResult {
    StepResult {
        status,
        output,
        error,
        attempts: 1,
        iterations: iteration,
        started_at: Some(started_at),
        completed_at: (status != StepStatus::Suspended).then(Utc::now),
        suspend_payload: None,
    }
}
