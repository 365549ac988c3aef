//! In-memory task store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{
    EngineError, NewTask, QueueCounts, QueueLoad, StatusUpdate, TaskId, TaskRecord,
};
use crate::ports::{Clock, SystemClock, TaskStore};
use crate::queue::{ClaimOutcome, TaskFilter, TaskTable, UpdateOutcome};

/// Task store kept entirely in memory.
///
/// Design:
/// - One `Mutex<TaskTable>` serializes every operation.
/// - `notify_waiters` after each mutation wakes idle dispatchers.
pub struct InMemoryTaskStore {
    table: Mutex<TaskTable>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(TaskTable::new()),
            clock,
            notify: Arc::new(Notify::new()),
        }
    }

    fn changed(&self) {
        self.notify.notify_waiters();
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn submit(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskRecord>, EngineError> {
        let records = self
            .table
            .lock()
            .await
            .insert_batch(tasks, self.clock.now())?;
        self.changed();
        Ok(records)
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        self.table.lock().await.get(id).cloned()
    }

    async fn update_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, EngineError> {
        let outcome = self
            .table
            .lock()
            .await
            .update_status(id, update, self.clock.now())?;
        if outcome.changed {
            self.changed();
        }
        Ok(outcome)
    }

    async fn claim(
        &self,
        id: TaskId,
        queue_limit: Option<usize>,
    ) -> Result<ClaimOutcome, EngineError> {
        let outcome = self
            .table
            .lock()
            .await
            .claim(id, queue_limit, self.clock.now())?;
        if matches!(outcome, ClaimOutcome::Claimed(_)) {
            self.changed();
        }
        Ok(outcome)
    }

    async fn eligible(&self, queue: &str) -> Result<Vec<TaskRecord>, EngineError> {
        Ok(self.table.lock().await.eligible(queue, self.clock.now()))
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, EngineError> {
        Ok(self.table.lock().await.list(&filter))
    }

    async fn queue_loads(&self) -> Result<Vec<QueueLoad>, EngineError> {
        Ok(self.table.lock().await.queue_loads())
    }

    async fn next_wake(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self.table.lock().await.next_wake(self.clock.now()))
    }

    async fn counts(&self, queue: Option<&str>) -> Result<QueueCounts, EngineError> {
        Ok(self.table.lock().await.counts(queue))
    }

    fn changes(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
