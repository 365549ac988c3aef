//! Submission inputs: a task draft and the per-call enqueue options.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::ids::TaskId;
use super::priority::Priority;
use super::task::TaskArguments;

/// Queue used when neither the caller nor the job names one.
pub const DEFAULT_QUEUE: &str = "default";

/// Attempt ceiling used when nothing else sets one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A fully resolved task, ready to be inserted into a store.
///
/// The id is chosen before submission so a batch can reference its own
/// members as dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    pub name: String,
    pub arguments: TaskArguments,
    pub priority: Priority,
    pub queue: String,
    pub dependencies: Vec<TaskId>,
    pub max_attempts: u32,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::from_ulid(Ulid::new()),
            name: name.into(),
            arguments: TaskArguments::default(),
            priority: Priority::default(),
            queue: DEFAULT_QUEUE.to_string(),
            dependencies: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_arguments(mut self, arguments: TaskArguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Per-call overrides of a job's registered defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    pub queue: Option<String>,
    pub dependencies: Vec<TaskId>,
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Depend on every id in `dependencies`.
    pub fn after(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}
