//! Execution of one simple step: schema checks, deadline, and retries.
//!
//! A `SimpleTask` is built by the scheduler with everything the invocation
//! needs and runs as its own tokio task. It never touches the run context;
//! the outcome goes back to the scheduler as a `SimpleReport`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use trellis_types::event::RunEvent;
use trellis_types::workflow::{ErrorKind, Failure, RetryPolicy, StepResult, StepStatus};
use uuid::Uuid;

use crate::event::EventBus;

use super::context::ContextView;
use super::retry::RetryHandler;
use super::schema::Schema;
use super::step::{StepHandler, StepInput, StepOutcome};

pub(crate) struct SimpleTask {
    pub run_id: Uuid,
    pub step_id: String,
    pub step_path: String,
    pub handler: Arc<dyn StepHandler>,
    pub input: Value,
    pub resumed: bool,
    pub view: ContextView,
    pub iteration: u32,
    pub policy: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub input_schema: Option<Schema>,
    pub output_schema: Option<Schema>,
    pub events: EventBus,
    /// Cancelled when the run is cancelled or times out; cuts retry waits short.
    pub stop: CancellationToken,
}

pub(crate) struct SimpleReport {
    pub step_id: String,
    pub result: StepResult,
    pub variables: Map<String, Value>,
}

impl SimpleTask {
    pub(crate) async fn run(self) -> SimpleReport {
        let started_at = Utc::now();
        let mut attempt = 1;

        loop {
            self.events.publish(RunEvent::StepStarted {
                run_id: self.run_id,
                step_path: self.step_path.clone(),
                attempt,
            });
            tracing::debug!(run_id = %self.run_id, step_id = %self.step_id, attempt, "invoking step");

            let clock = Instant::now();
            let failure = match self.invoke(attempt).await {
                Ok(StepOutcome::Output { value, variables }) => {
                    let duration_ms = clock.elapsed().as_millis() as u64;
                    self.events.publish(RunEvent::StepCompleted {
                        run_id: self.run_id,
                        step_path: self.step_path.clone(),
                        duration_ms,
                    });
                    return SimpleReport {
                        step_id: self.step_id.clone(),
                        result: StepResult {
                            status: StepStatus::Success,
                            output: Some(value),
                            attempts: attempt,
                            iterations: self.iteration,
                            started_at: Some(started_at),
                            completed_at: Some(Utc::now()),
                            ..StepResult::default()
                        },
                        variables,
                    };
                }
                Ok(StepOutcome::Suspend(payload)) => {
                    tracing::info!(run_id = %self.run_id, step_path = %self.step_path, "step requested suspension");
                    self.events.publish(RunEvent::StepSuspended {
                        run_id: self.run_id,
                        step_path: self.step_path.clone(),
                        payload: payload.clone(),
                    });
                    return self.report_suspended(started_at, attempt, payload);
                }
                Err(failure) => failure,
            };

            let will_retry = RetryHandler::should_retry(self.policy.as_ref(), attempt, failure.kind);
            self.events.publish(RunEvent::StepFailed {
                run_id: self.run_id,
                step_path: self.step_path.clone(),
                error: failure.clone(),
                will_retry,
            });

            let policy = match (&self.policy, will_retry) {
                (Some(policy), true) => policy,
                _ => return self.report_failed(started_at, attempt, failure),
            };

            let delay = RetryHandler::backoff(policy, attempt);
            tracing::warn!(
                run_id = %self.run_id,
                step_id = %self.step_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "step failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => {
                    tracing::debug!(run_id = %self.run_id, step_id = %self.step_id, "retry abandoned, run stopping");
                    return self.report_failed(started_at, attempt, failure);
                }
            }
            attempt += 1;
        }
    }

    /// One invocation: defaults, input validation, handler under deadline,
    /// output validation.
    async fn invoke(&self, attempt: u32) -> Result<StepOutcome, Failure> {
        let mut input = self.input.clone();
        if let Some(schema) = &self.input_schema {
            schema.apply_defaults(&mut input);
            schema
                .validate(&input)
                .map_err(|e| Failure::new(ErrorKind::Validation, format!("input: {e}")))?;
        }

        let call = self.handler.execute(StepInput {
            input,
            context: self.view.clone(),
            attempt,
            iteration: self.iteration,
            step_path: self.step_path.clone(),
            resumed: self.resumed,
        });

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                Failure::new(
                    ErrorKind::Timeout,
                    format!("step timed out after {}ms", limit.as_millis()),
                )
            })?,
            None => call.await,
        }
        .map_err(|e| Failure::new(e.kind(), e.to_string()))?;

        if let (Some(schema), StepOutcome::Output { value, .. }) = (&self.output_schema, &outcome) {
            schema
                .validate(value)
                .map_err(|e| Failure::new(ErrorKind::Validation, format!("output: {e}")))?;
        }
        Ok(outcome)
    }

    fn report_failed(&self, started_at: chrono::DateTime<Utc>, attempt: u32, failure: Failure) -> SimpleReport {
        tracing::debug!(run_id = %self.run_id, step_id = %self.step_id, attempts = attempt, "step failed");
        SimpleReport {
            step_id: self.step_id.clone(),
            result: StepResult {
                status: StepStatus::Failed,
                error: Some(failure),
                attempts: attempt,
                iterations: self.iteration,
                started_at: Some(started_at),
                completed_at: Some(Utc::now()),
                ..StepResult::default()
            },
            variables: Map::new(),
        }
    }

    fn report_suspended(
        &self,
        started_at: chrono::DateTime<Utc>,
        attempt: u32,
        payload: Option<Value>,
    ) -> SimpleReport {
        SimpleReport {
            step_id: self.step_id.clone(),
            result: StepResult {
                status: StepStatus::Suspended,
                attempts: attempt,
                iterations: self.iteration,
                started_at: Some(started_at),
                suspend_payload: payload,
                ..StepResult::default()
            },
            variables: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use crate::workflow::context::ExecutionContext;
    use crate::workflow::schema::FieldType;
    use crate::workflow::step::StepError;

    fn task(handler: Arc<dyn StepHandler>) -> SimpleTask {
        let ctx = ExecutionContext::new("wf", Uuid::now_v7(), json!({}));
        SimpleTask {
            run_id: ctx.run_id,
            step_id: "work".to_string(),
            step_path: "work".to_string(),
            handler,
            input: json!({"topic": "AI"}),
            resumed: false,
            view: ContextView::snapshot(&ctx),
            iteration: 1,
            policy: None,
            timeout: None,
            input_schema: None,
            output_schema: None,
            events: EventBus::new(64),
            stop: CancellationToken::new(),
        }
    }

    fn handler<F, Fut>(f: F) -> Arc<dyn StepHandler>
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
    {
        Arc::new(f)
    }

    fn counting_failures(fail_times: u32, calls: Arc<AtomicU32>) -> Arc<dyn StepHandler> {
        handler(move |_input: StepInput| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_times {
                    Err(StepError::failed(format!("attempt {n} failed")))
                } else {
                    Ok(StepOutcome::output(json!({"calls": n})))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_success_reports_output() {
        let echo = handler(|input: StepInput| async move {
            Ok(StepOutcome::output(json!({"echo": input.get_str("topic")})).with_variable("seen", json!(1)))
        });
        let report = task(echo).run().await;
        assert_eq!(report.result.status, StepStatus::Success);
        assert_eq!(report.result.output, Some(json!({"echo": "AI"})));
        assert_eq!(report.result.attempts, 1);
        assert_eq!(report.variables["seen"], json!(1));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut t = task(counting_failures(2, calls.clone()));
        t.policy = Some(RetryPolicy::new(3, 1, 2.0));
        let report = t.run().await;
        assert_eq!(report.result.status, StepStatus::Success);
        assert_eq!(report.result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut t = task(counting_failures(u32::MAX, calls.clone()));
        t.policy = Some(RetryPolicy::new(3, 1, 1.0));
        let mut rx = t.events.subscribe();
        let report = t.run().await;

        assert_eq!(report.result.status, StepStatus::Failed);
        assert_eq!(report.result.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let error = report.result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StepExecution);
        assert_eq!(error.message, "attempt 4 failed");

        let mut will_retry = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::StepFailed { will_retry: r, .. } = event {
                will_retry.push(r);
            }
        }
        assert_eq!(will_retry, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let slow = handler(move |_input: StepInput| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StepOutcome::output(json!(null)))
            }
        });
        let mut t = task(slow);
        t.timeout = Some(Duration::from_millis(20));
        t.policy = Some(RetryPolicy::new(3, 1, 1.0));
        let report = t.run().await;

        assert_eq!(report.result.status, StepStatus::Failed);
        assert_eq!(report.result.error.unwrap().kind, ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_input_schema_defaults_and_validation() {
        let passthrough = handler(|input: StepInput| async move {
            Ok(StepOutcome::output(input.input.clone()))
        });
        let mut t = task(passthrough.clone());
        t.input_schema = Some(
            Schema::object()
                .required("topic", FieldType::String)
                .with_default("words", FieldType::Integer, json!(300)),
        );
        let report = t.run().await;
        assert_eq!(report.result.output.unwrap()["words"], json!(300));

        let mut t = task(passthrough);
        t.input = json!({});
        t.input_schema = Some(Schema::object().required("topic", FieldType::String));
        let report = t.run().await;
        assert_eq!(report.result.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_output_schema_violation() {
        let bad = handler(|_input: StepInput| async { Ok(StepOutcome::output(json!({"text": 5}))) });
        let mut t = task(bad);
        t.output_schema = Some(Schema::object().required("text", FieldType::String));
        let report = t.run().await;
        let error = report.result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(error.message.starts_with("output:"));
    }

    #[tokio::test]
    async fn test_suspend_is_reported() {
        let gate = handler(|_input: StepInput| async { Ok(StepOutcome::suspend(json!({"reason": "approval"}))) });
        let report = task(gate).run().await;
        assert_eq!(report.result.status, StepStatus::Suspended);
        assert_eq!(report.result.suspend_payload, Some(json!({"reason": "approval"})));
        assert!(report.result.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_stop_abandons_retry_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut t = task(counting_failures(u32::MAX, calls.clone()));
        t.policy = Some(RetryPolicy::new(3, 60_000, 1.0));
        t.stop.cancel();
        let report = t.run().await;
        assert_eq!(report.result.status, StepStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
