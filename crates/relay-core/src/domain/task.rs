//! Task record: the persisted row for one task instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::EngineError;
use super::ids::TaskId;
use super::priority::Priority;
use super::spec::NewTask;
use super::status::{CancelCause, StatusUpdate, TaskStatus};

/// Recorded on a failed task that carried no message.
const EMPTY_ERROR: &str = "job failed without an error message";

const INTERRUPTED_ERROR: &str = "attempt interrupted by restart";

/// Arguments of a task: ordered positional values plus named values.
///
/// Job bodies receive them decoded into their argument type: positional
/// values decode as the type's field sequence, named values by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArguments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub named: Map<String, Value>,
}

impl TaskArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: Map::new(),
        }
    }

    pub fn named(values: Map<String, Value>) -> Self {
        Self {
            positional: Vec::new(),
            named: values,
        }
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn with_named(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Capture a typed argument value.
    ///
    /// Structs become named arguments, sequences positional ones, and a unit
    /// value no arguments at all.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::to_value(value)? {
            Value::Null => Self::new(),
            Value::Object(map) => Self::named(map),
            Value::Array(values) => Self::positional(values),
            scalar => Self::positional(vec![scalar]),
        })
    }

    /// The single JSON payload a job body decodes from.
    pub fn to_payload(&self) -> Result<Value, String> {
        match (self.positional.is_empty(), self.named.is_empty()) {
            (true, true) => Ok(Value::Null),
            (false, true) => Ok(Value::Array(self.positional.clone())),
            (true, false) => Ok(Value::Object(self.named.clone())),
            (false, false) => Err("cannot mix positional and named arguments".to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String },

    /// The process stopped while the attempt was running.
    Interrupted,
}

/// One execution attempt of a task, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
}

/// Metadata, arguments and outcome of a task.
///
/// Design:
/// - This is the single source of truth for task state.
/// - All transitions go through `apply`, which enforces the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,

    /// Submission order assigned by the store (FIFO tie-break).
    pub seq: u64,

    pub name: String,
    pub arguments: TaskArguments,
    pub priority: Priority,
    pub queue: String,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,

    /// Start of the latest attempt.
    pub started_at: Option<DateTime<Utc>>,

    /// Set when the task reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<Value>,
    pub error: Option<String>,

    pub dependencies: Vec<TaskId>,

    pub attempt_count: u32,
    pub max_attempts: u32,

    /// Not eligible for dispatch before this instant (retry backoff).
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,

    /// A failed task with this flag set will not be retried.
    #[serde(default)]
    pub retries_exhausted: bool,

    #[serde(default)]
    pub cancel_cause: Option<CancelCause>,

    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl TaskRecord {
    pub fn new(seq: u64, draft: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id: draft.id,
            seq,
            name: draft.name,
            arguments: draft.arguments,
            priority: draft.priority,
            queue: draft.queue,
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            dependencies: draft.dependencies,
            attempt_count: 0,
            max_attempts: draft.max_attempts.max(1),
            not_before: None,
            retries_exhausted: false,
            cancel_cause: None,
            attempts: Vec::new(),
        }
    }

    /// Completed, cancelled, or failed with no retry left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.retries_exhausted,
            TaskStatus::Pending | TaskStatus::Running => false,
        }
    }

    /// Pending and past its backoff gate. Says nothing about dependencies.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before.is_none_or(|at| at <= now)
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Apply a status update.
    ///
    /// Returns `Ok(false)` when the update is a no-op (cancelling a task that
    /// is already cancelled).
    pub fn apply(&mut self, update: StatusUpdate, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let target = update.target();
        if matches!(update, StatusUpdate::Cancel { .. }) && self.status == TaskStatus::Cancelled {
            return Ok(false);
        }
        let awaiting_retry = self.status == TaskStatus::Failed && !self.retries_exhausted;
        let cancel_before_retry = target == TaskStatus::Cancelled && awaiting_retry;
        if !self.status.can_transition_to(target) && !cancel_before_retry {
            return Err(self.invalid(target));
        }

        match update {
            StatusUpdate::Start => {
                self.status = TaskStatus::Running;
                self.attempt_count += 1;
                self.not_before = None;
                self.started_at = Some(now.max(self.created_at));
                self.attempts.push(AttemptRecord {
                    attempt: self.attempt_count,
                    started_at: now,
                    finished_at: None,
                    outcome: None,
                });
            }
            StatusUpdate::Complete { result } => {
                self.status = TaskStatus::Completed;
                self.result = Some(result);
                self.error = None;
                self.finish(now, AttemptOutcome::Succeeded);
            }
            StatusUpdate::Fail { error, terminal } => {
                let error = if error.trim().is_empty() {
                    EMPTY_ERROR.to_string()
                } else {
                    error
                };
                self.status = TaskStatus::Failed;
                self.retries_exhausted = terminal || !self.attempts_remaining();
                self.finish(now, AttemptOutcome::Failed {
                    error: error.clone(),
                });
                self.error = Some(error);
                if !self.retries_exhausted {
                    // Not terminal yet; cleared again by the retry.
                    self.completed_at = None;
                }
            }
            StatusUpdate::Retry { not_before } => {
                if self.retries_exhausted || !self.attempts_remaining() {
                    return Err(self.invalid(target));
                }
                // The message stays in the attempt history.
                self.status = TaskStatus::Pending;
                self.error = None;
                self.not_before = Some(not_before);
            }
            StatusUpdate::Cancel { cause } => {
                self.status = TaskStatus::Cancelled;
                self.error = None;
                self.not_before = None;
                self.cancel_cause = Some(cause);
                self.completed_at = Some(now.max(self.created_at));
            }
        }
        Ok(true)
    }

    /// Close an attempt that was running when the process stopped.
    ///
    /// The attempt counts towards `max_attempts`: the task goes back to
    /// pending if attempts remain, otherwise it fails terminally. Returns
    /// whether the task was requeued.
    pub fn interrupt(&mut self, now: DateTime<Utc>) -> Result<bool, EngineError> {
        if self.status != TaskStatus::Running {
            return Err(self.invalid(TaskStatus::Failed));
        }
        if let Some(last) = self.attempts.last_mut()
            && last.outcome.is_none()
        {
            last.finished_at = Some(now);
            last.outcome = Some(AttemptOutcome::Interrupted);
        }
        self.apply(
            StatusUpdate::Fail {
                error: INTERRUPTED_ERROR.to_string(),
                terminal: false,
            },
            now,
        )?;
        if self.retries_exhausted {
            return Ok(false);
        }
        self.apply(StatusUpdate::Retry { not_before: now }, now)?;
        Ok(true)
    }

    fn finish(&mut self, now: DateTime<Utc>, outcome: AttemptOutcome) {
        let finished = now.max(self.started_at.unwrap_or(self.created_at));
        self.completed_at = Some(finished);
        if let Some(last) = self.attempts.last_mut()
            && last.outcome.is_none()
        {
            last.finished_at = Some(finished);
            last.outcome = Some(outcome);
        }
    }

    fn invalid(&self, to: TaskStatus) -> EngineError {
        EngineError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(max_attempts: u32) -> TaskRecord {
        let draft = NewTask::new("generate_invoice_pdf").with_max_attempts(max_attempts);
        TaskRecord::new(1, draft, Utc::now())
    }

    #[test]
    fn new_record_is_pending() {
        let r = record(3);
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.attempt_count, 0);
        assert!(r.is_due(Utc::now()));
        assert!(!r.is_terminal());
    }

    #[test]
    fn start_then_complete_sets_result_and_timestamps() {
        let mut r = record(3);
        let now = Utc::now();
        r.apply(StatusUpdate::Start, now).unwrap();
        assert_eq!(r.attempt_count, 1);
        r.apply(StatusUpdate::Complete { result: json!("/tmp/a.pdf") }, now)
            .unwrap();

        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.result, Some(json!("/tmp/a.pdf")));
        assert!(r.error.is_none());
        assert!(r.created_at <= r.started_at.unwrap());
        assert!(r.started_at.unwrap() <= r.completed_at.unwrap());
        assert_eq!(r.attempts[0].outcome, Some(AttemptOutcome::Succeeded));
    }

    #[test]
    fn failure_with_attempts_left_can_retry() {
        let mut r = record(3);
        let now = Utc::now();
        r.apply(StatusUpdate::Start, now).unwrap();
        r.apply(
            StatusUpdate::Fail {
                error: "smtp timeout".into(),
                terminal: false,
            },
            now,
        )
        .unwrap();
        assert_eq!(r.status, TaskStatus::Failed);
        assert!(!r.is_terminal());
        assert_eq!(r.error.as_deref(), Some("smtp timeout"));

        let later = now + Duration::seconds(2);
        r.apply(StatusUpdate::Retry { not_before: later }, now).unwrap();
        assert_eq!(r.status, TaskStatus::Pending);
        assert!(r.error.is_none());
        assert!(!r.is_due(now));
        assert!(r.is_due(later));
    }

    #[test]
    fn last_attempt_failure_is_terminal_and_cannot_retry() {
        let mut r = record(1);
        let now = Utc::now();
        r.apply(StatusUpdate::Start, now).unwrap();
        r.apply(
            StatusUpdate::Fail {
                error: "boom".into(),
                terminal: false,
            },
            now,
        )
        .unwrap();

        assert!(r.is_terminal());
        let err = r
            .apply(StatusUpdate::Retry { not_before: now }, now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn failure_awaiting_its_retry_can_be_cancelled() {
        let now = Utc::now();
        let fail = || StatusUpdate::Fail {
            error: "smtp timeout".into(),
            terminal: false,
        };
        let cancel = || StatusUpdate::Cancel {
            cause: CancelCause::Requested,
        };

        let mut r = record(3);
        r.apply(StatusUpdate::Start, now).unwrap();
        r.apply(fail(), now).unwrap();
        assert!(r.apply(cancel(), now).unwrap());
        assert_eq!(r.status, TaskStatus::Cancelled);
        assert_eq!(r.error, None);
        assert!(r.apply(StatusUpdate::Retry { not_before: now }, now).is_err());

        let mut exhausted = record(1);
        exhausted.apply(StatusUpdate::Start, now).unwrap();
        exhausted.apply(fail(), now).unwrap();
        assert!(matches!(
            exhausted.apply(cancel(), now),
            Err(EngineError::InvalidTransition { from: TaskStatus::Failed, .. })
        ));
    }

    #[test]
    fn failed_task_always_has_a_message() {
        let mut r = record(1);
        let now = Utc::now();
        r.apply(StatusUpdate::Start, now).unwrap();
        r.apply(
            StatusUpdate::Fail {
                error: "  ".into(),
                terminal: true,
            },
            now,
        )
        .unwrap();
        assert!(!r.error.as_deref().unwrap().trim().is_empty());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut r = record(3);
        let now = Utc::now();
        assert!(r.apply(StatusUpdate::Cancel { cause: CancelCause::Requested }, now).unwrap());
        let snapshot = r.clone();
        assert!(!r.apply(StatusUpdate::Cancel { cause: CancelCause::Requested }, now).unwrap());
        assert_eq!(r, snapshot);
    }

    #[test]
    fn cannot_cancel_running_or_complete_twice() {
        let mut r = record(3);
        let now = Utc::now();
        r.apply(StatusUpdate::Start, now).unwrap();
        assert!(r.apply(StatusUpdate::Cancel { cause: CancelCause::Requested }, now).is_err());

        r.apply(StatusUpdate::Complete { result: json!(true) }, now).unwrap();
        assert!(r.apply(StatusUpdate::Complete { result: json!(false) }, now).is_err());
        assert_eq!(r.result, Some(json!(true)));
    }

    #[test]
    fn interrupt_requeues_while_attempts_remain() {
        let mut r = record(2);
        let now = Utc::now();
        r.apply(StatusUpdate::Start, now).unwrap();

        assert!(r.interrupt(now).unwrap());
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.error, None);
        assert_eq!(r.max_attempts, 2);
        assert_eq!(r.attempts[0].outcome, Some(AttemptOutcome::Interrupted));
    }

    #[test]
    fn interrupted_final_attempt_fails_the_task() {
        let mut r = record(1);
        let now = Utc::now();
        r.apply(StatusUpdate::Start, now).unwrap();

        assert!(!r.interrupt(now).unwrap());
        assert_eq!(r.status, TaskStatus::Failed);
        assert!(r.is_terminal());
        assert_eq!(r.max_attempts, 1);
        assert_eq!(r.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert_eq!(r.attempts[0].outcome, Some(AttemptOutcome::Interrupted));
    }

    #[test]
    fn interrupt_only_applies_to_running_tasks() {
        let mut r = record(3);
        assert!(r.interrupt(Utc::now()).is_err());
        assert_eq!(r.status, TaskStatus::Pending);
    }

    #[test]
    fn arguments_reject_mixed_forms() {
        let args = TaskArguments::new().with_arg(42).with_named("due_days", 30);
        assert!(args.to_payload().is_err());
    }

    #[test]
    fn arguments_capture_struct_as_named() {
        #[derive(Serialize)]
        struct Args {
            invoice_id: u64,
        }
        let args = TaskArguments::from_value(&Args { invoice_id: 7 }).unwrap();
        assert!(args.positional.is_empty());
        assert_eq!(args.to_payload().unwrap(), json!({"invoice_id": 7}));
    }
}
