//! Run control API: start, resume, cancel, observe, and inspect runs.
//!
//! `Engine` owns the registered workflow definitions, the checkpoint store,
//! and the event bus. Every run is persisted before its first step runs and
//! after every step transition, so a suspended run can be resumed by any
//! engine sharing the same store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trellis_types::config::EngineConfig;
use trellis_types::event::RunEvent;
use trellis_types::workflow::{ErrorKind, Failure, RunRecord, RunStatus, StepStatus};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::run::RunStore;

use super::checkpoint::{
    locate_suspended, suspended_paths, CheckpointError, CheckpointManager, StepPath,
};
use super::context::{ContextError, ExecutionContext};
use super::definition::Workflow;
use super::scheduler::{drive, BoxFuture, DriveEnd, ResumeDirective, RunScope, SnapshotSink};
use super::step::StepKind;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("cannot resume run {run_id}: {reason}")]
    InvalidResumeTarget { run_id: Uuid, reason: String },

    #[error("condition of step '{step_path}' could not be evaluated: {message}")]
    ConditionEvaluation { step_path: String, message: String },

    #[error("run {run_id} is {status}, not active")]
    RunNotActive { run_id: Uuid, status: RunStatus },

    #[error("run {0} is still executing")]
    RunActive(Uuid),

    #[error("run {0} already exists")]
    RunExists(Uuid),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("step task failed: {0}")]
    Join(String),
}

impl EngineError {
    /// Taxonomy kind for errors that correspond to one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::InvalidResumeTarget { .. } => Some(ErrorKind::InvalidResumeTarget),
            EngineError::ConditionEvaluation { .. } => Some(ErrorKind::ConditionEvaluation),
            _ => None,
        }
    }

    fn as_failure(&self) -> Failure {
        Failure::new(self.kind().unwrap_or(ErrorKind::StepExecution), self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Per-call overrides for `start_with` and `resume_with`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<Uuid>,
    /// Deadline for this call; falls back to the workflow's, then the engine's.
    pub timeout: Option<Duration>,
    /// External cancellation signal. `Engine::cancel` works either way.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome of a `start` or `resume` call.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Projected output, present when the run completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Status of every step, including those never reached. Steps inside
    /// nested workflows use dotted paths.
    pub steps: BTreeMap<String, StepStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_step_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_payload: Option<Value>,
    #[serde(skip)]
    pub context: ExecutionContext,
}

impl RunResult {
    fn new(workflow: &Workflow, ctx: ExecutionContext, status: RunStatus) -> Self {
        let mut steps = BTreeMap::new();
        collect_statuses(workflow, Some(&ctx), None, &mut steps);
        Self {
            run_id: ctx.run_id,
            workflow_id: workflow.id().to_string(),
            status,
            output: None,
            steps,
            error: None,
            suspended_step_path: None,
            suspend_payload: None,
            context: ctx,
        }
    }

    pub fn step_status(&self, path: &str) -> StepStatus {
        self.steps.get(path).copied().unwrap_or_default()
    }

    /// Output of a top-level step.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.context.output_of(step_id)
    }
}

fn collect_statuses(
    workflow: &Workflow,
    ctx: Option<&ExecutionContext>,
    prefix: Option<&str>,
    out: &mut BTreeMap<String, StepStatus>,
) {
    for step in workflow.graph().steps() {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{}", step.id),
            None => step.id.clone(),
        };
        let status = ctx.map(|c| c.status_of(&step.id)).unwrap_or_default();
        if let StepKind::Composite(inner) = &step.kind {
            let child = ctx.and_then(|c| c.children.get(&step.id));
            collect_statuses(inner, child, Some(&path), out);
        }
        out.insert(path, status);
    }
}

fn payload_at(ctx: &ExecutionContext, path: &StepPath) -> Option<Value> {
    match path.tail() {
        Some(rest) => payload_at(ctx.children.get(path.head())?, &rest),
        None => ctx.step(path.head())?.suspend_payload.clone(),
    }
}

// ---------------------------------------------------------------------------
// Snapshot sink
// ---------------------------------------------------------------------------

/// Persists the top-level context as `running` after every transition.
struct RecordSink<'a, R: RunStore> {
    checkpoint: &'a CheckpointManager<R>,
    record: &'a mut RunRecord,
}

impl<R: RunStore> SnapshotSink for RecordSink<'_, R> {
    fn snapshot<'s>(&'s mut self, ctx: &'s ExecutionContext) -> BoxFuture<'s, Result<(), CheckpointError>> {
        Box::pin(
            self.checkpoint
                .save(self.record, ctx, RunStatus::Running, None, None),
        )
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner<R: RunStore> {
    workflows: DashMap<String, Arc<Workflow>>,
    checkpoint: CheckpointManager<R>,
    event_bus: EventBus,
    config: EngineConfig,
    /// Serializes resume and cancel calls per run.
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Cancellation tokens of runs executing in this process.
    active: DashMap<Uuid, CancellationToken>,
}

/// Workflow engine. Cheap to clone; clones share registrations, the store,
/// and the event bus.
pub struct Engine<R: RunStore> {
    inner: Arc<EngineInner<R>>,
}

impl<R: RunStore> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RunStore> Engine<R> {
    pub fn new(store: R, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                workflows: DashMap::new(),
                checkpoint: CheckpointManager::new(store),
                event_bus: EventBus::new(config.event_capacity),
                config,
                run_locks: DashMap::new(),
                active: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &R {
        self.inner.checkpoint.repo()
    }

    /// Register a workflow definition, replacing any with the same id.
    pub fn register(&self, workflow: Workflow) -> Arc<Workflow> {
        let workflow = Arc::new(workflow);
        let id = workflow.id().to_string();
        if self
            .inner
            .workflows
            .insert(id.clone(), Arc::clone(&workflow))
            .is_some()
        {
            tracing::warn!(workflow_id = %id, "replaced registered workflow");
        } else {
            tracing::debug!(workflow_id = %id, steps = workflow.graph().len(), "registered workflow");
        }
        workflow
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.inner
            .workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Registered workflow ids, sorted.
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .workflows
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Receive every event of every run from now on.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.inner.event_bus.subscribe()
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.inner.active.contains_key(&run_id)
    }

    // -----------------------------------------------------------------------
    // Starting and resuming
    // -----------------------------------------------------------------------

    /// Start a run and wait until it completes, fails, or suspends.
    pub async fn start(&self, workflow_id: &str, trigger: Value) -> Result<RunResult, EngineError> {
        self.start_with(workflow_id, trigger, RunOptions::default()).await
    }

    pub async fn start_with(
        &self,
        workflow_id: &str,
        trigger: Value,
        options: RunOptions,
    ) -> Result<RunResult, EngineError> {
        let workflow = self
            .workflow(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        let run_id = options.run_id.unwrap_or_else(Uuid::now_v7);

        let lock = self.run_lock(run_id);
        let _guard = lock.lock_owned().await;
        if self.is_active(run_id) || self.inner.checkpoint.find(run_id).await?.is_some() {
            return Err(EngineError::RunExists(run_id));
        }

        let ctx = ExecutionContext::new(workflow.id(), run_id, trigger);
        let record = self.inner.checkpoint.create_run(&ctx).await?;
        tracing::info!(run_id = %run_id, workflow_id = %workflow.id(), "starting run");

        self.execute(workflow, ctx, record, None, options).await
    }

    /// Resume a suspended run at `step_path` with `input` as the step's new
    /// input.
    pub async fn resume(&self, run_id: Uuid, step_path: &str, input: Value) -> Result<RunResult, EngineError> {
        self.resume_with(run_id, step_path, input, RunOptions::default()).await
    }

    pub async fn resume_with(
        &self,
        run_id: Uuid,
        step_path: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<RunResult, EngineError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock_owned().await;

        let record = self.load(run_id).await?;
        let invalid = |reason: String| EngineError::InvalidResumeTarget { run_id, reason };
        if record.status != RunStatus::Suspended {
            return Err(invalid(format!("run is {}, not suspended", record.status)));
        }

        let workflow = self
            .workflow(&record.workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(record.workflow_id.clone()))?;
        let ctx = CheckpointManager::<R>::restore_context(&record)?;
        let path = StepPath::parse(step_path).ok_or_else(|| invalid(format!("'{step_path}' is not a step path")))?;
        locate_suspended(&workflow, &ctx, &path).map_err(invalid)?;

        tracing::info!(run_id = %run_id, step_path = %path, "resuming run");
        let options = RunOptions {
            run_id: Some(run_id),
            ..options
        };
        self.execute(workflow, ctx, record, Some(ResumeDirective { path, input }), options)
            .await
    }

    /// Start a run in the background and stream its events. The stream ends
    /// after the run's completed, failed, or suspended event.
    pub fn stream_start(&self, workflow_id: &str, trigger: Value) -> impl Stream<Item = RunEvent> + Send + use<R> {
        enum Progress {
            Received(Result<RunEvent, RecvError>),
            Joined(Result<Result<RunResult, EngineError>, tokio::task::JoinError>),
        }

        let engine = self.clone();
        let workflow_id = workflow_id.to_string();
        let run_id = Uuid::now_v7();
        let mut rx = self.subscribe();

        async_stream::stream! {
            let mut start = Some(tokio::spawn({
                let engine = engine.clone();
                let workflow_id = workflow_id.clone();
                async move {
                    engine
                        .start_with(&workflow_id, trigger, RunOptions::default().run_id(run_id))
                        .await
                }
            }));

            loop {
                let progress = match start.as_mut() {
                    Some(handle) => tokio::select! {
                        received = rx.recv() => Progress::Received(received),
                        joined = handle => Progress::Joined(joined),
                    },
                    None => Progress::Received(rx.recv().await),
                };

                match progress {
                    Progress::Received(Ok(event)) => {
                        if event.run_id() != run_id {
                            continue;
                        }
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Progress::Received(Err(RecvError::Lagged(skipped))) => {
                        tracing::warn!(run_id = %run_id, skipped, "event stream lagged");
                    }
                    Progress::Received(Err(RecvError::Closed)) => break,
                    Progress::Joined(joined) => {
                        start = None;
                        let failure = match joined {
                            Ok(Ok(_)) => continue,
                            Ok(Err(e)) => e.as_failure(),
                            Err(e) => Failure::new(ErrorKind::StepExecution, format!("run task failed: {e}")),
                        };
                        // The run may have published its own terminal event
                        // before returning the error.
                        let mut terminal_seen = false;
                        while let Ok(event) = rx.try_recv() {
                            if event.run_id() != run_id {
                                continue;
                            }
                            terminal_seen = event.is_terminal();
                            yield event;
                            if terminal_seen {
                                break;
                            }
                        }
                        if !terminal_seen {
                            yield RunEvent::Failed {
                                run_id,
                                workflow_id: workflow_id.clone(),
                                error: failure,
                            };
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Call `callback` with every event of `run_id` until its terminal event.
    ///
    /// Subscribes before returning, so events published after this call are
    /// never missed. Watching a run that already ended waits forever; abort
    /// the handle in that case.
    pub fn watch<F>(&self, run_id: Uuid, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(RunEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.run_id() == run_id => {
                        let terminal = event.is_terminal();
                        callback(event);
                        if terminal {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(run_id = %run_id, skipped, "watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Control and inspection
    // -----------------------------------------------------------------------

    /// Cancel a run. An executing run stops dispatching and fails with
    /// `Cancelled` once in-flight steps settle; a suspended run fails
    /// immediately.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        if let Some(token) = self.inner.active.get(&run_id).map(|t| t.value().clone()) {
            tracing::info!(run_id = %run_id, "cancelling run");
            token.cancel();
            return Ok(());
        }

        let lock = self.run_lock(run_id);
        let _guard = lock.lock_owned().await;
        let mut record = self.load(run_id).await?;
        if record.status != RunStatus::Suspended {
            return Err(EngineError::RunNotActive {
                run_id,
                status: record.status,
            });
        }

        let ctx = CheckpointManager::<R>::restore_context(&record)?;
        let failure = Failure::new(ErrorKind::Cancelled, "run was cancelled while suspended");
        self.inner
            .checkpoint
            .save(&mut record, &ctx, RunStatus::Failed, None, Some(failure.clone()))
            .await?;
        self.inner.run_locks.remove(&run_id);

        tracing::info!(run_id = %run_id, "cancelled suspended run");
        self.inner.event_bus.publish(RunEvent::Failed {
            run_id,
            workflow_id: record.workflow_id,
            error: failure,
        });
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        self.load(run_id).await
    }

    /// Stored runs, newest first, optionally filtered.
    pub async fn list_runs(
        &self,
        workflow_id: Option<&str>,
        status: Option<RunStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, EngineError> {
        Ok(self.inner.checkpoint.list(workflow_id, status, limit).await?)
    }

    /// Delete a run record. Returns `false` if there was none.
    pub async fn purge_run(&self, run_id: Uuid) -> Result<bool, EngineError> {
        if self.is_active(run_id) {
            return Err(EngineError::RunActive(run_id));
        }
        let deleted = self.inner.checkpoint.purge(run_id).await?;
        self.inner.run_locks.remove(&run_id);
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inner
                .run_locks
                .entry(run_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    async fn load(&self, run_id: Uuid) -> Result<RunRecord, EngineError> {
        self.inner.checkpoint.load(run_id).await.map_err(|e| match e {
            CheckpointError::RunNotFound(id) => EngineError::RunNotFound(id),
            other => other.into(),
        })
    }

    fn scope(&self, run_id: Uuid, workflow: &Workflow, cancel: CancellationToken, timeout: Option<Duration>) -> RunScope {
        let config = &self.inner.config;
        let timeout = timeout
            .or(workflow.timeout())
            .unwrap_or(Duration::from_secs(config.run_timeout_secs));
        RunScope {
            run_id,
            stop: cancel.child_token(),
            cancel,
            deadline: tokio::time::Instant::now() + timeout,
            semaphore: config.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            default_step_timeout: config.default_step_timeout_secs.map(Duration::from_secs),
            max_loop_iterations: config.max_loop_iterations,
            events: self.inner.event_bus.clone(),
        }
    }

    async fn execute(
        &self,
        workflow: Arc<Workflow>,
        mut ctx: ExecutionContext,
        mut record: RunRecord,
        resume: Option<ResumeDirective>,
        options: RunOptions,
    ) -> Result<RunResult, EngineError> {
        let run_id = ctx.run_id;
        let checkpoint = &self.inner.checkpoint;

        checkpoint
            .save(&mut record, &ctx, RunStatus::Running, None, None)
            .await?;

        let cancel = options.cancel.unwrap_or_default();
        self.inner.active.insert(run_id, cancel.clone());
        let scope = self.scope(run_id, &workflow, cancel, options.timeout);

        self.inner.event_bus.publish(RunEvent::Started {
            run_id,
            workflow_id: workflow.id().to_string(),
            resumed: resume.is_some(),
        });
        let clock = std::time::Instant::now();

        let end = {
            let mut sink = RecordSink {
                checkpoint,
                record: &mut record,
            };
            drive(
                scope,
                Arc::clone(&workflow),
                &mut ctx,
                None,
                resume,
                Some(&mut sink as &mut dyn SnapshotSink),
            )
            .await
        };
        self.inner.active.remove(&run_id);

        let duration_ms = clock.elapsed().as_millis() as u64;
        let outcome = self.finish(&workflow, ctx, &mut record, end, duration_ms).await;
        if record.status.is_terminal() {
            self.inner.run_locks.remove(&run_id);
        }
        outcome
    }

    /// Persist the end state of a drive and announce it.
    async fn finish(
        &self,
        workflow: &Workflow,
        ctx: ExecutionContext,
        record: &mut RunRecord,
        end: Result<DriveEnd, EngineError>,
        duration_ms: u64,
    ) -> Result<RunResult, EngineError> {
        let run_id = ctx.run_id;
        let workflow_id = workflow.id().to_string();
        let checkpoint = &self.inner.checkpoint;
        let bus = &self.inner.event_bus;

        match end {
            Ok(DriveEnd::Completed) => {
                let output = workflow.project(&ctx);
                checkpoint
                    .save(record, &ctx, RunStatus::Completed, None, None)
                    .await?;
                tracing::info!(run_id = %run_id, workflow_id = %workflow_id, duration_ms, "run completed");
                bus.publish(RunEvent::Completed {
                    run_id,
                    workflow_id,
                    duration_ms,
                    output: output.clone(),
                });

                let mut result = RunResult::new(workflow, ctx, RunStatus::Completed);
                result.output = Some(output);
                Ok(result)
            }
            Ok(DriveEnd::Suspended) => {
                let path = suspended_paths(workflow, &ctx).into_iter().next();
                let path_str = path.as_ref().map(ToString::to_string);
                checkpoint
                    .save(record, &ctx, RunStatus::Suspended, path_str.clone(), None)
                    .await?;
                tracing::info!(run_id = %run_id, step_path = ?path_str, "run suspended");
                bus.publish(RunEvent::Suspended {
                    run_id,
                    step_path: path_str.clone().unwrap_or_default(),
                });

                let payload = path.as_ref().and_then(|p| payload_at(&ctx, p));
                let mut result = RunResult::new(workflow, ctx, RunStatus::Suspended);
                result.suspended_step_path = path_str;
                result.suspend_payload = payload;
                Ok(result)
            }
            Ok(DriveEnd::Failed(failure)) => {
                checkpoint
                    .save(record, &ctx, RunStatus::Failed, None, Some(failure.clone()))
                    .await?;
                tracing::info!(run_id = %run_id, workflow_id = %workflow_id, error = %failure, "run failed");
                bus.publish(RunEvent::Failed {
                    run_id,
                    workflow_id,
                    error: failure.clone(),
                });

                let mut result = RunResult::new(workflow, ctx, RunStatus::Failed);
                result.error = Some(failure);
                Ok(result)
            }
            Err(e) => {
                let failure = e.as_failure();
                tracing::error!(run_id = %run_id, workflow_id = %workflow_id, error = %e, "run aborted");
                if let Err(save_err) = checkpoint
                    .save(record, &ctx, RunStatus::Failed, None, Some(failure.clone()))
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %save_err, "failed to record aborted run");
                }
                bus.publish(RunEvent::Failed {
                    run_id,
                    workflow_id,
                    error: failure,
                });
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
