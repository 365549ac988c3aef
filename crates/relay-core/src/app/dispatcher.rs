//! Dispatcher: picks the next eligible task and claims it.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::domain::{EngineError, TaskRecord};
use crate::ports::{Clock, TaskStore};
use crate::queue::ClaimOutcome;

/// Pick the task to run next among eligible candidates of one queue.
///
/// Highest priority first, then oldest `created_at`, then lowest `seq`.
pub fn select_next(candidates: &[TaskRecord]) -> Option<&TaskRecord> {
    candidates
        .iter()
        .max_by_key(|t| (t.priority, Reverse(t.created_at), Reverse(t.seq)))
}

/// Moves tasks from pending to running.
///
/// Design:
/// - Holds no task state; every scan reads the store.
/// - Queues are scanned round-robin, starting one further on each scan.
/// - The claim is a compare-and-set in the store, so concurrent dispatchers
///   never hand the same task out twice.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    limits: HashMap<String, usize>,
    idle_poll: Duration,
    cursor: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        limits: HashMap<String, usize>,
        idle_poll: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limits,
            idle_poll,
            cursor: AtomicUsize::new(0),
        }
    }

    /// One scan over all queues. Returns the claimed task, if any.
    pub async fn dispatch_once(&self) -> Result<Option<TaskRecord>, EngineError> {
        let active: Vec<_> = self
            .store
            .queue_loads()
            .await?
            .into_iter()
            .filter(|load| load.pending > 0)
            .collect();
        if active.is_empty() {
            return Ok(None);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
        for offset in 0..active.len() {
            let load = &active[(start + offset) % active.len()];
            let limit = self.limits.get(&load.name).copied();
            if limit.is_some_and(|limit| load.running >= limit) {
                debug!(queue = %load.name, running = load.running, "queue at capacity");
                continue;
            }

            let mut candidates = self.store.eligible(&load.name).await?;
            while let Some(next) = select_next(&candidates) {
                let id = next.id;
                match self.store.claim(id, limit).await? {
                    ClaimOutcome::Claimed(record) => {
                        debug!(
                            task_id = %record.id,
                            queue = %record.queue,
                            job = %record.name,
                            priority = %record.priority,
                            attempt = record.attempt_count,
                            "dispatched"
                        );
                        return Ok(Some(record));
                    }
                    ClaimOutcome::QueueFull => break,
                    ClaimOutcome::NotPending => candidates.retain(|c| c.id != id),
                }
            }
        }
        Ok(None)
    }

    /// Wait until a task is claimed.
    ///
    /// Rescans on every store change, at the next backoff deadline, and at
    /// least every `idle_poll`. Returns `None` once shutdown is signalled.
    pub async fn lease(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<TaskRecord>, EngineError> {
        let changes = self.store.changes();
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            // Register before scanning so a change during the scan is not lost.
            let notified = changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.dispatch_once().await? {
                return Ok(Some(task));
            }

            let wait = match self.store.next_wake().await? {
                Some(at) => (at - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.idle_poll),
                None => self.idle_poll,
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
