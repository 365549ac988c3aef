//! Engine: the submission and status surface used by callers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::info;

use super::dispatcher::Dispatcher;
use super::executor::Executor;
use super::worker_pool::WorkerPool;
use crate::config::EngineConfig;
use crate::domain::{
    CancelCause, EngineError, EnqueueOptions, NewTask, QueueCounts, StatusUpdate, TaskArguments,
    TaskId, TaskRecord, TaskStatus, TaskStatusView,
};
use crate::ports::{IdGenerator, TaskStore};
use crate::queue::TaskFilter;
use crate::typed::{Job, JobRegistry};

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) config: EngineConfig,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) executor: Arc<Executor>,
}

/// Handle to a running scheduler. Cheap to clone.
///
/// # Example
/// ```ignore
/// let engine = EngineBuilder::new()
///     .register::<GenerateInvoice, _>(GenerateInvoiceHandler)?
///     .build()
///     .await?;
/// let workers = engine.start();
///
/// let id = engine.submit(&GenerateInvoice { customer_id: 7 }, EnqueueOptions::new()).await?;
/// let view = engine.wait(id, Duration::from_secs(30)).await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub(crate) fn from_inner(inner: EngineInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Spawn the configured number of workers.
    pub fn start(&self) -> WorkerPool {
        self.start_workers(self.inner.config.workers)
    }

    pub fn start_workers(&self, n: usize) -> WorkerPool {
        info!(workers = n, jobs = ?self.inner.registry.names(), "starting workers");
        WorkerPool::spawn(
            n,
            Arc::clone(&self.inner.dispatcher),
            Arc::clone(&self.inner.executor),
        )
    }

    /// Submit a task by job name.
    ///
    /// Arguments are checked against the job's argument type before anything
    /// is stored.
    pub async fn enqueue(
        &self,
        name: &str,
        arguments: TaskArguments,
        options: EnqueueOptions,
    ) -> Result<TaskId, EngineError> {
        let id = self.inner.ids.generate_task_id();
        let draft = self.prepare(id, name, arguments, options)?;
        let records = self.inner.store.submit(vec![draft]).await?;
        for record in &records {
            log_submitted(record);
        }
        Ok(id)
    }

    /// Submit a typed job.
    pub async fn submit<J: Job>(&self, job: &J, options: EnqueueOptions) -> Result<TaskId, EngineError> {
        let arguments = TaskArguments::from_value(job)?;
        self.enqueue(J::NAME, arguments, options).await
    }

    /// Start a batch whose members may depend on each other.
    pub fn batch(&self) -> Batch<'_> {
        Batch {
            engine: self,
            drafts: Vec::new(),
        }
    }

    pub async fn get(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        self.inner.store.get(id).await
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskStatusView, EngineError> {
        Ok(TaskStatusView::from(&self.inner.store.get(id).await?))
    }

    /// Result of a completed task.
    ///
    /// Fails with the reason the task did not complete, or `NotFinished` while
    /// it still may.
    pub async fn result(&self, id: TaskId) -> Result<Value, EngineError> {
        let record = self.inner.store.get(id).await?;
        outcome_of(&record)
    }

    /// Wait until the task is terminal, or fail with `Timeout`.
    pub async fn wait(&self, id: TaskId, timeout: Duration) -> Result<TaskStatusView, EngineError> {
        let deadline = Instant::now() + timeout;
        let changes = self.inner.store.changes();
        let poll = self.inner.config.poll_interval();
        loop {
            let notified = changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self.inner.store.get(id).await?;
            if record.is_terminal() {
                return Ok(TaskStatusView::from(&record));
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(id));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Cancel a pending task and, transitively, its dependents.
    ///
    /// A task between attempts counts as pending, whether it is waiting out
    /// its backoff or its failure was recorded and the retry is not yet
    /// scheduled. Running, completed and terminally failed tasks are rejected
    /// with `InvalidTransition`. Returns false if the task was already
    /// cancelled.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, EngineError> {
        let outcome = self
            .inner
            .store
            .update_status(
                id,
                StatusUpdate::Cancel {
                    cause: CancelCause::Requested,
                },
            )
            .await?;
        if outcome.changed {
            info!(
                task_id = %id,
                cancelled_dependents = outcome.cascaded.len(),
                "task cancelled"
            );
        }
        Ok(outcome.changed)
    }

    pub async fn counts(&self, queue: Option<&str>) -> Result<QueueCounts, EngineError> {
        self.inner.store.counts(queue).await
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskStatusView>, EngineError> {
        let records = self.inner.store.list(filter).await?;
        Ok(records.iter().map(TaskStatusView::from).collect())
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Resolve a submission against the job's registered defaults.
    fn prepare(
        &self,
        id: TaskId,
        name: &str,
        arguments: TaskArguments,
        options: EnqueueOptions,
    ) -> Result<NewTask, EngineError> {
        let handler = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownJob(name.to_string()))?;
        handler
            .validate(&arguments)
            .map_err(|reason| EngineError::InvalidArguments {
                name: name.to_string(),
                reason,
            })?;

        let defaults = handler.defaults();
        let max_attempts = options
            .max_attempts
            .or(defaults.max_attempts)
            .unwrap_or(self.inner.config.default_max_attempts)
            .max(1);
        Ok(NewTask {
            id,
            name: name.to_string(),
            arguments,
            priority: options.priority.unwrap_or(defaults.priority),
            queue: options.queue.unwrap_or_else(|| defaults.queue.to_string()),
            dependencies: options.dependencies,
            max_attempts,
        })
    }
}

/// Tasks submitted together, atomically.
///
/// Ids can be reserved up front so members can name each other as
/// dependencies. Nothing is stored until `submit`; a rejected batch stores
/// nothing.
pub struct Batch<'a> {
    engine: &'a Engine,
    drafts: Vec<NewTask>,
}

impl Batch<'_> {
    /// Reserve an id for a later `add_with_id`.
    pub fn reserve_id(&self) -> TaskId {
        self.engine.inner.ids.generate_task_id()
    }

    pub fn add(
        &mut self,
        name: &str,
        arguments: TaskArguments,
        options: EnqueueOptions,
    ) -> Result<TaskId, EngineError> {
        let id = self.reserve_id();
        self.add_with_id(id, name, arguments, options)
    }

    pub fn add_job<J: Job>(&mut self, job: &J, options: EnqueueOptions) -> Result<TaskId, EngineError> {
        let arguments = TaskArguments::from_value(job)?;
        self.add(J::NAME, arguments, options)
    }

    pub fn add_with_id(
        &mut self,
        id: TaskId,
        name: &str,
        arguments: TaskArguments,
        options: EnqueueOptions,
    ) -> Result<TaskId, EngineError> {
        let draft = self.engine.prepare(id, name, arguments, options)?;
        self.drafts.push(draft);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    /// Store every member, or none.
    pub async fn submit(self) -> Result<Vec<TaskId>, EngineError> {
        if self.drafts.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.engine.inner.store.submit(self.drafts).await?;
        for record in &records {
            log_submitted(record);
        }
        Ok(records.into_iter().map(|r| r.id).collect())
    }
}

fn log_submitted(record: &TaskRecord) {
    if record.status == TaskStatus::Cancelled {
        info!(
            task_id = %record.id,
            queue = %record.queue,
            job = %record.name,
            cause = ?record.cancel_cause,
            "task submitted behind a dead dependency; cancelled"
        );
    } else {
        info!(
            task_id = %record.id,
            queue = %record.queue,
            job = %record.name,
            priority = %record.priority,
            dependencies = record.dependencies.len(),
            "task submitted"
        );
    }
}

fn outcome_of(record: &TaskRecord) -> Result<Value, EngineError> {
    match record.status {
        TaskStatus::Completed => Ok(record.result.clone().unwrap_or(Value::Null)),
        TaskStatus::Failed if record.retries_exhausted => Err(EngineError::JobExecution {
            id: record.id,
            message: record.error.clone().unwrap_or_default(),
        }),
        TaskStatus::Cancelled => match record.cancel_cause.and_then(|c| c.dependency()) {
            Some(dependency) => Err(EngineError::DependencyFailed {
                id: record.id,
                dependency,
            }),
            None => Err(EngineError::Cancelled(record.id)),
        },
        status => Err(EngineError::NotFinished {
            id: record.id,
            status,
        }),
    }
}
