//! Task status machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Task status.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Failed -> Pending (retry, bounded by max_attempts)
/// - Pending -> Running -> Failed (terminal once retries are exhausted)
/// - Pending -> Cancelled (requested, or a dependency failed/was cancelled)
/// - Failed -> Cancelled while a retry is still to come
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies, backoff, or a free worker.
    Pending,

    /// Claimed by a worker.
    Running,

    /// Job body returned a result.
    Completed,

    /// Job body failed. Terminal only when the record's retries are exhausted.
    Failed,

    /// Will never run.
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// Record-level rules are checked by `TaskRecord::apply`: the retry
    /// ceiling, idempotent cancel, and cancelling a failed task whose retry
    /// is still to come.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Why a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelCause {
    /// A caller asked for it.
    Requested,

    /// A direct dependency failed terminally.
    DependencyFailed { dependency: TaskId },

    /// A direct dependency was itself cancelled.
    DependencyCancelled { dependency: TaskId },
}

impl CancelCause {
    pub fn dependency(&self) -> Option<TaskId> {
        match self {
            CancelCause::Requested => None,
            CancelCause::DependencyFailed { dependency }
            | CancelCause::DependencyCancelled { dependency } => Some(*dependency),
        }
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Requested => f.write_str("cancellation requested"),
            CancelCause::DependencyFailed { dependency } => {
                write!(f, "dependency {dependency} failed")
            }
            CancelCause::DependencyCancelled { dependency } => {
                write!(f, "dependency {dependency} was cancelled")
            }
        }
    }
}

/// A requested status change, applied by the task store.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Pending -> Running. Normally issued through `TaskStore::claim`.
    Start,

    /// Running -> Completed.
    Complete { result: serde_json::Value },

    /// Running -> Failed. `terminal` ends the task even if attempts remain.
    Fail { error: String, terminal: bool },

    /// Failed -> Pending, eligible again at `not_before`.
    Retry {
        not_before: chrono::DateTime<chrono::Utc>,
    },

    /// Pending (or failed with a retry to come) -> Cancelled. Idempotent.
    Cancel { cause: CancelCause },
}

impl StatusUpdate {
    /// Status this update moves the task into.
    pub fn target(&self) -> TaskStatus {
        match self {
            StatusUpdate::Start => TaskStatus::Running,
            StatusUpdate::Complete { .. } => TaskStatus::Completed,
            StatusUpdate::Fail { .. } => TaskStatus::Failed,
            StatusUpdate::Retry { .. } => TaskStatus::Pending,
            StatusUpdate::Cancel { .. } => TaskStatus::Cancelled,
        }
    }
}
