//! Task table: the synchronous state behind every task store.
//!
//! Design:
//! - Records and the dependency graph live together so a transition and its
//!   cancellation cascade are applied in one step.
//! - Validation happens before any mutation; a rejected call leaves the table
//!   untouched.
//! - Callers supply `now`; the table never reads a clock.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::dependency::DependencyGraph;
use super::resolver::{DependencyResolver, Readiness, StatusSnapshot};
use crate::domain::{
    EngineError, NewTask, QueueCounts, QueueLoad, StatusUpdate, TaskId, TaskRecord, TaskStatus,
};

/// Filter for `TaskTable::list`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub queue: Option<String>,
    pub status: Option<TaskStatus>,
    pub name: Option<String>,
}

impl TaskFilter {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn matches(&self, record: &TaskRecord) -> bool {
        self.queue.as_ref().is_none_or(|q| *q == record.queue)
            && self.status.is_none_or(|s| s == record.status)
            && self.name.as_ref().is_none_or(|n| *n == record.name)
    }
}

/// Result of a compare-and-set claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The task is now running; the record reflects the new attempt.
    Claimed(TaskRecord),

    /// Someone else claimed it, or it is not eligible any more.
    NotPending,

    /// The task's queue already runs its concurrency limit.
    QueueFull,
}

/// What a status update changed.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub record: TaskRecord,

    /// False when the update was an idempotent no-op.
    pub changed: bool,

    /// Dependents cancelled as a consequence.
    pub cascaded: Vec<TaskId>,
}

/// Recovery summary after loading a table from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Tasks whose running attempt was interrupted, now pending again.
    pub interrupted: Vec<TaskId>,

    /// Failed tasks whose retry had not been scheduled yet.
    pub requeued: Vec<TaskId>,

    /// Interrupted on their last allowed attempt; now failed.
    pub exhausted: Vec<TaskId>,

    /// Dependents of `exhausted` tasks.
    pub cancelled: Vec<TaskId>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    records: HashMap<TaskId, TaskRecord>,
    graph: DependencyGraph,
    next_seq: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from persisted records.
    pub fn from_records(records: Vec<TaskRecord>) -> Result<Self, EngineError> {
        let mut table = Self::new();
        for record in records {
            if table.records.contains_key(&record.id) {
                return Err(EngineError::DuplicateTask(record.id));
            }
            table.next_seq = table.next_seq.max(record.seq + 1);
            for &dep in &record.dependencies {
                table.graph.add_dependency(record.id, dep);
            }
            table.records.insert(record.id, record);
        }
        for record in table.records.values() {
            if let Some(&missing) = record
                .dependencies
                .iter()
                .find(|d| !table.records.contains_key(d))
            {
                return Err(EngineError::UnknownDependency(missing));
            }
        }
        if let Some(path) = table.graph.detect_cycle() {
            return Err(EngineError::CyclicDependency { path });
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in submission order.
    pub fn records(&self) -> Vec<&TaskRecord> {
        let mut all: Vec<&TaskRecord> = self.records.values().collect();
        all.sort_by_key(|r| r.seq);
        all
    }

    pub fn get(&self, id: TaskId) -> Result<&TaskRecord, EngineError> {
        self.records.get(&id).ok_or(EngineError::NotFound(id))
    }

    /// Insert a batch atomically.
    ///
    /// Batch members may depend on each other. A member whose dependency
    /// already failed terminally or was cancelled is stored as cancelled.
    pub fn insert_batch(
        &mut self,
        drafts: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, EngineError> {
        let mut batch_ids = HashSet::new();
        for draft in &drafts {
            if self.records.contains_key(&draft.id) || !batch_ids.insert(draft.id) {
                return Err(EngineError::DuplicateTask(draft.id));
            }
        }
        for draft in &drafts {
            if let Some(&missing) = draft
                .dependencies
                .iter()
                .find(|d| !self.records.contains_key(d) && !batch_ids.contains(d))
            {
                return Err(EngineError::UnknownDependency(missing));
            }
        }

        let mut graph = self.graph.clone();
        for draft in &drafts {
            if let Some(path) = graph.would_create_cycle(draft.id, &draft.dependencies) {
                return Err(EngineError::CyclicDependency { path });
            }
            for &dep in &draft.dependencies {
                graph.add_dependency(draft.id, dep);
            }
        }

        // Validated; from here on nothing fails.
        self.graph = graph;
        let mut inserted = Vec::with_capacity(drafts.len());
        for mut draft in drafts {
            let mut seen = HashSet::new();
            draft.dependencies.retain(|d| seen.insert(*d));

            let mut record = TaskRecord::new(self.next_seq, draft, now);
            self.next_seq += 1;
            if let Readiness::Blocked { cause } =
                DependencyResolver::readiness(&record, &self.snapshot(&record.dependencies))
            {
                // Pending -> Cancelled is always allowed.
                let _ = record.apply(StatusUpdate::Cancel { cause }, now);
            }
            inserted.push(record.id);
            self.records.insert(record.id, record);
        }

        // A member may have been inserted before the dependency that got
        // cancelled above; only batch members can depend on batch members.
        let dead: Vec<TaskRecord> = inserted
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.status == TaskStatus::Cancelled)
            .cloned()
            .collect();
        for record in &dead {
            self.cancel_dependents(record, now);
        }
        Ok(inserted
            .into_iter()
            .filter_map(|id| self.records.get(&id).cloned())
            .collect())
    }

    /// Apply a status update, cascading cancellation to dependents when the
    /// task becomes terminal failed or cancelled.
    pub fn update_status(
        &mut self,
        id: TaskId,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, EngineError> {
        if update == StatusUpdate::Start {
            let record = self.get(id)?;
            if !self.is_ready(record) {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: record.status,
                    to: TaskStatus::Running,
                });
            }
        }

        let record = self.records.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        let changed = record.apply(update, now)?;
        let record = record.clone();

        let dead = record.is_terminal() && record.status != TaskStatus::Completed;
        let cascaded = if changed && dead {
            self.cancel_dependents(&record, now)
        } else {
            Vec::new()
        };
        Ok(UpdateOutcome {
            record,
            changed,
            cascaded,
        })
    }

    /// Compare-and-set pending -> running.
    ///
    /// The task must still be pending, due, and ready, and its queue must be
    /// under `queue_limit` running tasks.
    pub fn claim(
        &mut self,
        id: TaskId,
        queue_limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, EngineError> {
        let record = self.get(id)?;
        if !record.is_due(now) || !self.is_ready(record) {
            return Ok(ClaimOutcome::NotPending);
        }
        if let Some(limit) = queue_limit
            && self.running_in(&record.queue) >= limit
        {
            return Ok(ClaimOutcome::QueueFull);
        }
        let outcome = self.update_status(id, StatusUpdate::Start, now)?;
        Ok(ClaimOutcome::Claimed(outcome.record))
    }

    /// Pending tasks of `queue` that may run at `now`.
    pub fn eligible(&self, queue: &str, now: DateTime<Utc>) -> Vec<TaskRecord> {
        self.records
            .values()
            .filter(|r| r.queue == queue && r.is_due(now) && self.is_ready(r))
            .cloned()
            .collect()
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        self.records()
            .into_iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// `(status, terminal)` for each known id.
    fn snapshot(&self, ids: &[TaskId]) -> StatusSnapshot {
        ids.iter()
            .filter_map(|id| self.records.get(id).map(|r| (*id, (r.status, r.is_terminal()))))
            .collect()
    }

    /// Pending and running counts per queue, ordered by queue name.
    pub fn queue_loads(&self) -> Vec<QueueLoad> {
        let mut loads: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for r in self.records.values() {
            let entry = loads.entry(r.queue.as_str()).or_default();
            match r.status {
                TaskStatus::Pending => entry.0 += 1,
                TaskStatus::Running => entry.1 += 1,
                _ => {}
            }
        }
        loads
            .into_iter()
            .map(|(name, (pending, running))| QueueLoad {
                name: name.to_string(),
                pending,
                running,
            })
            .collect()
    }

    /// Earliest backoff deadline after `now` among pending tasks.
    pub fn next_wake(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.records
            .values()
            .filter(|r| r.status == TaskStatus::Pending)
            .filter_map(|r| r.not_before)
            .filter(|at| *at > now)
            .min()
    }

    pub fn counts(&self, queue: Option<&str>) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for r in self.records.values() {
            if queue.is_none_or(|q| q == r.queue) {
                counts.record(r.status);
            }
        }
        counts
    }

    pub fn running_in(&self, queue: &str) -> usize {
        self.records
            .values()
            .filter(|r| r.queue == queue && r.status == TaskStatus::Running)
            .count()
    }

    /// Put interrupted and not-yet-rescheduled work back to pending.
    ///
    /// An interrupted attempt counts; a task that had no attempts left
    /// fails terminally and its dependents are cancelled.
    pub fn recover(&mut self, now: DateTime<Utc>) -> Recovery {
        let mut recovery = Recovery::default();
        for record in self.records.values_mut() {
            match record.status {
                TaskStatus::Running => match record.interrupt(now) {
                    Ok(true) => recovery.interrupted.push(record.id),
                    Ok(false) => recovery.exhausted.push(record.id),
                    Err(_) => {}
                },
                TaskStatus::Failed if !record.retries_exhausted => {
                    if record
                        .apply(StatusUpdate::Retry { not_before: now }, now)
                        .is_ok()
                    {
                        recovery.requeued.push(record.id);
                    }
                }
                _ => {}
            }
        }
        recovery.interrupted.sort();
        recovery.requeued.sort();
        recovery.exhausted.sort();

        for id in recovery.exhausted.clone() {
            if let Some(record) = self.records.get(&id).cloned() {
                recovery.cancelled.extend(self.cancel_dependents(&record, now));
            }
        }
        recovery
    }

    /// Cancel the pending tasks downstream of a dead `origin`.
    fn cancel_dependents(&mut self, origin: &TaskRecord, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for (child, cause) in DependencyResolver::cascade(origin, &self.graph, &self.records) {
            if let Some(dependent) = self.records.get_mut(&child)
                && let Ok(true) = dependent.apply(StatusUpdate::Cancel { cause }, now)
            {
                cancelled.push(child);
            }
        }
        cancelled
    }

    fn is_ready(&self, record: &TaskRecord) -> bool {
        DependencyResolver::is_ready(record, &self.snapshot(&record.dependencies))
    }
}
