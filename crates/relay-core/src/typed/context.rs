//! Per-attempt context handed to job bodies.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{JobError, TaskId};

/// Result of one completed dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyResult {
    pub id: TaskId,
    pub name: String,
    pub result: Value,
}

/// Results of a task's dependencies, in declaration order.
///
/// Every dependency has completed by the time a task runs, so each one has a
/// result here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyResults {
    entries: Vec<DependencyResult>,
}

impl DependencyResults {
    pub fn new(entries: Vec<DependencyResult>) -> Self {
        Self { entries }
    }

    pub fn get(&self, id: TaskId) -> Option<&Value> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.result)
    }

    /// Result of the first dependency running job `name`.
    pub fn by_name(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.result)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyResult> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a job body knows about the attempt it runs in.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub task_id: TaskId,
    pub name: String,

    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,

    pub dependencies: DependencyResults,
}

impl JobContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Decode the result of the dependency that ran job `name`.
    ///
    /// A missing or undecodable result is a permanent error: retrying the
    /// task would see the same dependencies.
    pub fn dependency_result<T: DeserializeOwned>(&self, name: &str) -> Result<T, JobError> {
        let value = self.dependencies.by_name(name).ok_or_else(|| {
            JobError::permanent(format!("task {} has no dependency running '{name}'", self.task_id))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            JobError::permanent(format!("result of dependency '{name}' did not decode: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    fn ctx() -> JobContext {
        let pdf = TaskId::from_ulid(Ulid::new());
        let log = TaskId::from_ulid(Ulid::new());
        JobContext {
            task_id: TaskId::from_ulid(Ulid::new()),
            name: "send_invoice_email".into(),
            attempt: 1,
            max_attempts: 3,
            dependencies: DependencyResults::new(vec![
                DependencyResult {
                    id: pdf,
                    name: "generate_invoice_pdf".into(),
                    result: json!("/tmp/invoice_7.pdf"),
                },
                DependencyResult {
                    id: log,
                    name: "log_email_activity".into(),
                    result: json!(true),
                },
            ]),
        }
    }

    #[test]
    fn decodes_result_by_job_name() {
        let path: String = ctx().dependency_result("generate_invoice_pdf").unwrap();
        assert_eq!(path, "/tmp/invoice_7.pdf");
    }

    #[test]
    fn missing_dependency_is_permanent() {
        let err = ctx().dependency_result::<String>("generate_invoice").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn wrong_type_is_permanent() {
        let err = ctx().dependency_result::<u64>("log_email_activity").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn lookup_by_id() {
        let c = ctx();
        let first = c.dependencies.iter().next().unwrap().id;
        assert_eq!(c.dependencies.get(first), Some(&json!("/tmp/invoice_7.pdf")));
        assert!(!c.is_last_attempt());
    }
}
