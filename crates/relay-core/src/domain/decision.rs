//! Decision model: what happens to a task after its job body fails.

use std::time::Duration;

use super::errors::JobError;
use super::task::TaskRecord;
use crate::queue::RetryPolicy;

/// The next action for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run the task again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up; the failure is terminal.
    MarkFailed { reason: String },
}

/// Decides what to do with a failed attempt.
///
/// Deciders are pure: the worker pool applies the returned decision.
pub trait Decider: Send + Sync {
    /// `task` is the record as it was when the attempt started, so
    /// `attempt_count` already includes the failed attempt.
    fn decide(&self, task: &TaskRecord, error: &JobError) -> Decision;
}

/// Attempt-bounded retry with exponential backoff.
///
/// - Permanent job errors are never retried.
/// - Retry while `attempt_count < max_attempts`.
/// - Delay comes from the retry policy.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, error: &JobError) -> Decision {
        if !error.is_retryable() {
            return Decision::MarkFailed {
                reason: format!("permanent failure: {error}"),
            };
        }
        if task.attempt_count >= task.max_attempts {
            return Decision::MarkFailed {
                reason: format!(
                    "max attempts reached: {}/{}",
                    task.attempt_count, task.max_attempts
                ),
            };
        }

        let delay = self.retry_policy.next_delay(task.attempt_count);
        Decision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}",
                task.attempt_count + 1,
                task.max_attempts,
                delay
            ),
        }
    }
}
