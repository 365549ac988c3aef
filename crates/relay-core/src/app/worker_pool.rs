use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::dispatcher::Dispatcher;
use super::executor::Executor;

/// Pause after a store error before leasing again.
const ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Worker pool handle.
/// - `request_shutdown` stops leasing; in-flight job bodies run to completion
/// - `shutdown_and_join` also waits for every worker to exit
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers sharing one dispatcher.
    pub fn spawn(n: usize, dispatcher: Arc<Dispatcher>, executor: Arc<Executor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let d = Arc::clone(&dispatcher);
            let e = Arc::clone(&executor);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, d, e, &mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }

    /// Ask all workers to stop after their current task.
    pub fn request_shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<Executor>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        // lease() returns None once shutdown is requested.
        let task = match dispatcher.lease(shutdown_rx).await {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(e) => {
                error!(worker_id, error = %e, "lease failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        let task_id = task.id;
        if let Err(e) = executor.execute(task).await {
            error!(worker_id, task_id = %task_id, error = %e, "failed to record task outcome");
        }
    }
    debug!(worker_id, "worker stopped");
}
