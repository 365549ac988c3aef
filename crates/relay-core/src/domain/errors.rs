//! Engine and job errors.

use thiserror::Error;

use super::ids::TaskId;
use super::status::TaskStatus;

/// Errors surfaced by the engine and the task store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dependency cycle: {}", display_path(.path))]
    CyclicDependency { path: Vec<TaskId> },

    #[error("unknown dependency {0}")]
    UnknownDependency(TaskId),

    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {id} failed: {message}")]
    JobExecution { id: TaskId, message: String },

    #[error("task {id} cancelled: dependency {dependency} did not complete")]
    DependencyFailed { id: TaskId, dependency: TaskId },

    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("task {id} has not finished (status={status})")]
    NotFinished { id: TaskId, status: TaskStatus },

    #[error("timed out waiting for task {0}")]
    Timeout(TaskId),

    #[error("no job registered under name '{0}'")]
    UnknownJob(String),

    #[error("invalid arguments for job '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn display_path(path: &[TaskId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure raised by a job body.
///
/// Retryable by default; `permanent` failures skip the remaining attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    message: String,
    retryable: bool,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        Self::new(format!("io: {e}"))
    }
}

/// Undecodable data will not decode on the next attempt either.
impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        Self::permanent(format!("json: {e}"))
    }
}
