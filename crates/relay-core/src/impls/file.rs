//! Durable task store backed by a JSON file.
//!
//! The whole table is rewritten after every mutation: serialized to
//! `<path>.tmp`, then renamed over `<path>`, so a crash leaves either the old
//! or the new table on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::domain::{
    EngineError, NewTask, QueueCounts, QueueLoad, StatusUpdate, TaskId, TaskRecord,
};
use crate::ports::{Clock, TaskStore};
use crate::queue::{ClaimOutcome, TaskFilter, TaskTable, UpdateOutcome};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredTable {
    version: u32,
    tasks: Vec<TaskRecord>,
}

pub struct FileTaskStore {
    path: PathBuf,
    table: Mutex<TaskTable>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
}

impl FileTaskStore {
    /// Open (or create) the table at `path`.
    ///
    /// Work that was running when the previous process stopped goes back to
    /// pending, as do failed tasks whose retry was never scheduled. The
    /// interrupted attempt counts, so work interrupted on its last attempt
    /// fails instead.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let mut table = read_table(&path).await?;

        let recovery = table.recover(clock.now());
        for id in &recovery.interrupted {
            warn!(task_id = %id, "attempt interrupted by restart; task requeued");
        }
        for id in &recovery.requeued {
            warn!(task_id = %id, "failed task had no retry scheduled; task requeued");
        }
        for id in &recovery.exhausted {
            warn!(task_id = %id, "final attempt interrupted by restart; task failed");
        }
        for id in &recovery.cancelled {
            warn!(task_id = %id, "dependency failed during recovery; task cancelled");
        }
        info!(path = %path.display(), tasks = table.len(), "task store opened");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        write_table(&path, &table).await?;

        Ok(Self {
            path,
            table: Mutex::new(table),
            clock,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records stored at `path`, in submission order, without recovering or
    /// rewriting the file.
    pub async fn read_snapshot(path: impl AsRef<Path>) -> Result<Vec<TaskRecord>, EngineError> {
        let table = read_table(path.as_ref()).await?;
        Ok(table.records().into_iter().cloned().collect())
    }

    /// Run `op` against the table and persist the result.
    ///
    /// The in-memory table is rolled back if `op` or the write fails, so
    /// memory never runs ahead of disk.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut TaskTable, DateTime<Utc>) -> Result<T, EngineError>,
        dirty: impl FnOnce(&T) -> bool,
    ) -> Result<T, EngineError> {
        let mut table = self.table.lock().await;
        let backup = table.clone();
        let out = match op(&mut table, self.clock.now()) {
            Ok(out) => out,
            Err(e) => {
                *table = backup;
                return Err(e);
            }
        };
        if !dirty(&out) {
            return Ok(out);
        }
        if let Err(e) = write_table(&self.path, &table).await {
            *table = backup;
            return Err(e);
        }
        drop(table);
        self.notify.notify_waiters();
        Ok(out)
    }
}

async fn read_table(path: &Path) -> Result<TaskTable, EngineError> {
    match fs::read(path).await {
        Ok(bytes) => {
            let stored: StoredTable = serde_json::from_slice(&bytes)?;
            if stored.version != FORMAT_VERSION {
                return Err(EngineError::Persistence(format!(
                    "{}: unsupported format version {}",
                    path.display(),
                    stored.version
                )));
            }
            TaskTable::from_records(stored.tasks)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TaskTable::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_table(path: &Path, table: &TaskTable) -> Result<(), EngineError> {
    let stored = StoredTable {
        version: FORMAT_VERSION,
        tasks: table.records().into_iter().cloned().collect(),
    };
    let bytes = serde_json::to_vec_pretty(&stored)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await.map_err(|e| {
        EngineError::Persistence(format!("rename {} -> {}: {e}", tmp.display(), path.display()))
    })
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn submit(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskRecord>, EngineError> {
        self.mutate(|table, now| table.insert_batch(tasks, now), |_| true)
            .await
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        self.table.lock().await.get(id).cloned()
    }

    async fn update_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, EngineError> {
        self.mutate(
            |table, now| table.update_status(id, update, now),
            |outcome| outcome.changed,
        )
        .await
    }

    async fn claim(
        &self,
        id: TaskId,
        queue_limit: Option<usize>,
    ) -> Result<ClaimOutcome, EngineError> {
        self.mutate(
            |table, now| table.claim(id, queue_limit, now),
            |outcome| matches!(outcome, ClaimOutcome::Claimed(_)),
        )
        .await
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
