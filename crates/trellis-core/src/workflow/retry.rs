//! Retry decisions for failed step invocations.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter. Attempts are 1-based; with `attempts = 3` a step is
//! invoked at most four times.

use std::time::Duration;

use trellis_types::workflow::{ErrorKind, RetryPolicy};

use super::definition::Workflow;
use super::step::Step;

pub struct RetryHandler;

impl RetryHandler {
    /// The step's own policy, else the workflow default.
    pub fn effective_policy<'a>(step: &'a Step, workflow: &'a Workflow) -> Option<&'a RetryPolicy> {
        step.retry.as_ref().or(workflow.default_retry())
    }

    /// Whether the failed `attempt` should be followed by another.
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32, kind: ErrorKind) -> bool {
        match policy {
            Some(policy) => kind.is_retryable() && attempt <= policy.attempts,
            None => false,
        }
    }

    /// Delay before re-invoking after the failed `attempt`.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        policy.delay_for_attempt(attempt)
    }
}
