//! Executor: runs one claimed task and records its outcome.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::domain::{
    Decider, Decision, EngineError, JobError, StatusUpdate, TaskRecord, TaskStatus,
};
use crate::ports::{Clock, TaskStore};
use crate::typed::{DependencyResult, DependencyResults, JobContext, JobRegistry};

/// Runs a running task's job body and writes the result back.
///
/// Design:
/// - The registry is built at startup and read-only here.
/// - The job body runs on its own tokio task, so a panic becomes a failed
///   attempt instead of killing the worker.
/// - Failures go through the `Decider`; the executor only applies decisions.
pub struct Executor {
    store: Arc<dyn TaskStore>,
    registry: Arc<JobRegistry>,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<JobRegistry>,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            decider,
            clock,
        }
    }

    /// Execute a task that was just claimed.
    pub async fn execute(&self, task: TaskRecord) -> Result<(), EngineError> {
        let outcome = self.invoke(&task).await;
        match outcome {
            Ok(result) => {
                self.store
                    .update_status(task.id, StatusUpdate::Complete { result })
                    .await?;
                info!(
                    task_id = %task.id,
                    queue = %task.queue,
                    job = %task.name,
                    attempt = task.attempt_count,
                    "task completed"
                );
                Ok(())
            }
            Err(err) => self.record_failure(&task, err).await,
        }
    }

    async fn invoke(&self, task: &TaskRecord) -> Result<Value, JobError> {
        let handler = self.registry.get(&task.name).ok_or_else(|| {
            JobError::permanent(format!("no job registered under name '{}'", task.name))
        })?;
        let ctx = self
            .context(task)
            .await
            .map_err(|e| JobError::new(format!("loading dependency results: {e}")))?;

        let args = task.arguments.clone();
        match tokio::spawn(async move { handler.call(args, ctx).await }).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(JobError::new(format!(
                "job '{}' panicked",
                task.name
            ))),
            Err(join) => Err(JobError::new(format!("job '{}' aborted: {join}", task.name))),
        }
    }

    async fn context(&self, task: &TaskRecord) -> Result<JobContext, EngineError> {
        let mut entries = Vec::with_capacity(task.dependencies.len());
        for &dep in &task.dependencies {
            let record = self.store.get(dep).await?;
            entries.push(DependencyResult {
                id: dep,
                name: record.name,
                result: record.result.unwrap_or(Value::Null),
            });
        }
        Ok(JobContext {
            task_id: task.id,
            name: task.name.clone(),
            attempt: task.attempt_count,
            max_attempts: task.max_attempts,
            dependencies: DependencyResults::new(entries),
        })
    }

    async fn record_failure(&self, task: &TaskRecord, err: JobError) -> Result<(), EngineError> {
        match self.decider.decide(task, &err) {
            Decision::Retry { delay, reason } => {
                let failed = self
                    .store
                    .update_status(
                        task.id,
                        StatusUpdate::Fail {
                            error: err.message().to_string(),
                            terminal: false,
                        },
                    )
                    .await?;
                if failed.record.is_terminal() {
                    // The record had no attempts left after all.
                    self.log_terminal(task, &err, &reason, failed.cascaded.len());
                    return Ok(());
                }
                let delay = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::MAX);
                let not_before = self
                    .clock
                    .now()
                    .checked_add_signed(delay)
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
                match self
                    .store
                    .update_status(task.id, StatusUpdate::Retry { not_before })
                    .await
                {
                    Ok(_) => {}
                    Err(EngineError::InvalidTransition {
                        from: TaskStatus::Cancelled,
                        ..
                    }) => {
                        info!(task_id = %task.id, "task cancelled before its retry was scheduled");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                warn!(
                    task_id = %task.id,
                    queue = %task.queue,
                    job = %task.name,
                    attempt = task.attempt_count,
                    error = %err,
                    %reason,
                    "task failed; retry scheduled"
                );
                Ok(())
            }
            Decision::MarkFailed { reason } => {
                let failed = self
                    .store
                    .update_status(
                        task.id,
                        StatusUpdate::Fail {
                            error: err.message().to_string(),
                            terminal: true,
                        },
                    )
                    .await?;
                self.log_terminal(task, &err, &reason, failed.cascaded.len());
                Ok(())
            }
        }
    }

    fn log_terminal(&self, task: &TaskRecord, err: &JobError, reason: &str, cascaded: usize) {
        error!(
            task_id = %task.id,
            queue = %task.queue,
            job = %task.name,
            attempt = task.attempt_count,
            error = %err,
            reason,
            cancelled_dependents = cascaded,
            "task failed"
        );
    }
}
