//! Read-only views returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::TaskId;
use super::priority::Priority;
use super::status::{CancelCause, TaskStatus};
use super::task::TaskRecord;

/// What a caller sees when polling a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub id: TaskId,
    pub name: String,
    pub queue: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_cause: Option<CancelCause>,

    pub attempt_count: u32,
    pub max_attempts: u32,

    /// False only for a failed task that will still be retried.
    pub terminal: bool,
}

impl From<&TaskRecord> for TaskStatusView {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            queue: record.queue.clone(),
            priority: record.priority,
            status: record.status,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            result: record.result.clone(),
            error: record.error.clone(),
            cancel_cause: record.cancel_cause,
            attempt_count: record.attempt_count,
            max_attempts: record.max_attempts,
            terminal: record.is_terminal(),
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }
}

/// Load of one queue, used by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLoad {
    pub name: String,
    pub pending: usize,
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::NewTask;

    #[test]
    fn view_hides_empty_outcome_fields() {
        let record = TaskRecord::new(0, NewTask::new("log_email_activity"), Utc::now());
        let v = serde_json::to_value(TaskStatusView::from(&record)).unwrap();

        assert_eq!(v["status"], "pending");
        assert!(v.get("result").is_none());
        assert!(v.get("error").is_none());
        assert_eq!(v["terminal"], false);
    }

    #[test]
    fn counts_by_status() {
        let mut c = QueueCounts::default();
        c.record(TaskStatus::Pending);
        c.record(TaskStatus::Pending);
        c.record(TaskStatus::Failed);
        assert_eq!(c.pending, 2);
        assert_eq!(c.failed, 1);
        assert_eq!(c.total(), 3);
    }
}
