//! TaskStore port: the single source of truth for task state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::domain::{
    EngineError, NewTask, QueueCounts, QueueLoad, StatusUpdate, TaskId, TaskRecord,
};
use crate::queue::{ClaimOutcome, TaskFilter, UpdateOutcome};

/// Persistent table of task instances.
///
/// # Design
/// - Every operation runs under one store-wide lock, so reads are consistent
///   and `claim` is a true compare-and-set.
/// - A transition and the cancellation cascade it triggers are applied in the
///   same critical section.
/// - Timestamps come from the store's own clock.
/// - Every successful mutation wakes the waiters on `changes()`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a batch atomically. Rejection (cycle, unknown dependency,
    /// duplicate id) leaves the store unchanged.
    async fn submit(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskRecord>, EngineError>;

    async fn get(&self, id: TaskId) -> Result<TaskRecord, EngineError>;

    async fn update_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, EngineError>;

    /// Compare-and-set pending -> running.
    async fn claim(
        &self,
        id: TaskId,
        queue_limit: Option<usize>,
    ) -> Result<ClaimOutcome, EngineError>;

    /// Dispatchable tasks of `queue`: pending, due, every dependency completed.
    async fn eligible(&self, queue: &str) -> Result<Vec<TaskRecord>, EngineError>;

    async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, EngineError>;

    async fn queue_loads(&self) -> Result<Vec<QueueLoad>, EngineError>;

    /// Earliest backoff deadline still in the future.
    async fn next_wake(&self) -> Result<Option<DateTime<Utc>>, EngineError>;

    async fn counts(&self, queue: Option<&str>) -> Result<QueueCounts, EngineError>;

    /// Notified after every mutation.
    fn changes(&self) -> Arc<Notify>;
}
