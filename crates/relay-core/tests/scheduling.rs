//! End-to-end scheduling behavior through the public engine API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_core::domain::{AttemptOutcome, NewTask};
use relay_core::impls::FileTaskStore;
use relay_core::ports::{SystemClock, TaskStore};
use relay_core::{
    CancelCause, Engine, EngineBuilder, EngineConfig, EngineError, EnqueueOptions, Job,
    JobContext, JobError, Priority, RetryConfig, TaskArguments, TaskId, TaskStatus, handler_fn,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize)]
struct Record {
    label: String,
}

impl Job for Record {
    const NAME: &'static str = "record";
}

#[derive(Serialize, Deserialize)]
struct Noop;

impl Job for Noop {
    const NAME: &'static str = "noop";
}

#[derive(Serialize, Deserialize)]
struct RenderPdf {
    invoice_id: u64,
}

impl Job for RenderPdf {
    const NAME: &'static str = "generate_invoice_pdf";
}

#[derive(Serialize, Deserialize)]
struct SendEmail {
    invoice_id: u64,
}

impl Job for SendEmail {
    const NAME: &'static str = "send_invoice_email";
}

fn fast_config(workers: usize) -> EngineConfig {
    EngineConfig {
        workers,
        poll_interval_ms: 20,
        retry: RetryConfig {
            base_delay_ms: 5,
            multiplier: 1.0,
            max_delay_ms: 20,
        },
        ..EngineConfig::default()
    }
}

fn noop_builder(workers: usize) -> EngineBuilder {
    EngineBuilder::new()
        .with_config(fast_config(workers))
        .register::<Noop, _>(handler_fn(|_job: Noop, _ctx: JobContext| async {
            Ok::<_, JobError>(())
        }))
        .unwrap()
}

async fn wait_for_status(engine: &Engine, id: TaskId, status: TaskStatus) {
    tokio::time::timeout(WAIT, async {
        while engine.status(id).await.unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} never reached {status}"));
}

#[tokio::test]
async fn dispatches_by_priority() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    let engine = EngineBuilder::new()
        .with_config(fast_config(1))
        .register::<Record, _>(handler_fn(move |job: Record, _ctx: JobContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(job.label);
                Ok::<_, JobError>(())
            }
        }))
        .unwrap()
        .build()
        .await
        .unwrap();

    let mut ids = Vec::new();
    for (label, priority) in [("A", Priority::Low), ("B", Priority::High), ("C", Priority::Medium)] {
        let job = Record {
            label: label.to_string(),
        };
        ids.push(engine.submit(&job, EnqueueOptions::new().priority(priority)).await.unwrap());
    }

    let workers = engine.start();
    for id in ids {
        engine.wait(id, WAIT).await.unwrap();
    }
    workers.shutdown_and_join().await;

    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "A"]);
}

#[tokio::test]
async fn dependent_waits_for_its_dependency() {
    let gate = Arc::new(Semaphore::new(0));
    let held = Arc::clone(&gate);
    let engine = noop_builder(2)
        .register::<Record, _>(handler_fn(move |_job: Record, _ctx: JobContext| {
            let held = Arc::clone(&held);
            async move {
                let _permit = held.acquire().await.map_err(|e| JobError::new(e.to_string()))?;
                Ok::<_, JobError>(())
            }
        }))
        .unwrap()
        .build()
        .await
        .unwrap();

    let t1 = engine
        .submit(&Record { label: "t1".into() }, EnqueueOptions::new())
        .await
        .unwrap();
    let t2 = engine
        .submit(&Noop, EnqueueOptions::new().depends_on(t1))
        .await
        .unwrap();
    let workers = engine.start();

    wait_for_status(&engine, t1, TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.status(t2).await.unwrap().status, TaskStatus::Pending);

    gate.add_permits(1);
    let done = engine.wait(t2, WAIT).await.unwrap();
    workers.shutdown_and_join().await;

    let first = engine.get(t1).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.started_at >= first.completed_at);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let engine = EngineBuilder::new()
        .with_config(fast_config(1))
        .register::<RenderPdf, _>(handler_fn(move |_job: RenderPdf, ctx: JobContext| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    return Err(JobError::new(format!("renderer busy (attempt {})", ctx.attempt)));
                }
                Ok(ctx.attempt)
            }
        }))
        .unwrap()
        .build()
        .await
        .unwrap();
    let workers = engine.start();

    let id = engine
        .submit(&RenderPdf { invoice_id: 1 }, EnqueueOptions::new().max_attempts(3))
        .await
        .unwrap();
    let view = engine.wait(id, WAIT).await.unwrap();
    workers.shutdown_and_join().await;

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.attempt_count, 3);
    assert_eq!(view.error, None);
    assert_eq!(engine.result(id).await.unwrap(), json!(3));

    let record = engine.get(id).await.unwrap();
    let outcomes: Vec<_> = record.attempts.iter().map(|a| a.outcome.clone()).collect();
    assert!(matches!(outcomes[0], Some(AttemptOutcome::Failed { .. })));
    assert!(matches!(outcomes[1], Some(AttemptOutcome::Failed { .. })));
    assert_eq!(outcomes[2], Some(AttemptOutcome::Succeeded));
}

#[tokio::test]
async fn exhausted_task_fails_and_cancels_dependents() {
    let engine = noop_builder(2)
        .register::<RenderPdf, _>(handler_fn(|job: RenderPdf, _ctx: JobContext| async move {
            Err::<(), _>(JobError::new(format!("no template for invoice {}", job.invoice_id)))
        }))
        .unwrap()
        .build()
        .await
        .unwrap();

    let mut batch = engine.batch();
    let pdf = batch
        .add_job(&RenderPdf { invoice_id: 9 }, EnqueueOptions::new().max_attempts(2))
        .unwrap();
    let email = batch.add_job(&Noop, EnqueueOptions::new().depends_on(pdf)).unwrap();
    let report = batch.add_job(&Noop, EnqueueOptions::new().depends_on(email)).unwrap();
    batch.submit().await.unwrap();
    let workers = engine.start();

    let failed = engine.wait(pdf, WAIT).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempt_count, 2);
    assert_eq!(failed.error.as_deref(), Some("no template for invoice 9"));

    let cancelled = engine.wait(email, WAIT).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(
        cancelled.cancel_cause,
        Some(CancelCause::DependencyFailed { dependency: pdf })
    );
    assert_eq!(
        engine.status(report).await.unwrap().cancel_cause,
        Some(CancelCause::DependencyCancelled { dependency: email })
    );
    assert!(matches!(
        engine.result(email).await,
        Err(EngineError::DependencyFailed { dependency, .. }) if dependency == pdf
    ));
    assert!(matches!(engine.result(pdf).await, Err(EngineError::JobExecution { .. })));
    workers.shutdown_and_join().await;
}

#[tokio::test]
async fn permanent_error_skips_remaining_attempts() {
    let engine = EngineBuilder::new()
        .with_config(fast_config(1))
        .register::<SendEmail, _>(handler_fn(|_job: SendEmail, _ctx: JobContext| async {
            Err::<(), _>(JobError::permanent("customer has no email address"))
        }))
        .unwrap()
        .build()
        .await
        .unwrap();
    let workers = engine.start();

    let id = engine
        .submit(&SendEmail { invoice_id: 4 }, EnqueueOptions::new().max_attempts(5))
        .await
        .unwrap();
    let view = engine.wait(id, WAIT).await.unwrap();
    workers.shutdown_and_join().await;

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.attempt_count, 1);
}

#[tokio::test]
async fn cyclic_batch_is_rejected_without_side_effects() {
    let engine = noop_builder(1).build().await.unwrap();
    let existing = engine.submit(&Noop, EnqueueOptions::new()).await.unwrap();

    let mut batch = engine.batch();
    let a = batch.reserve_id();
    let b = batch.reserve_id();
    batch
        .add_with_id(a, Noop::NAME, TaskArguments::new(), EnqueueOptions::new().after([existing, b]))
        .unwrap();
    batch
        .add_with_id(b, Noop::NAME, TaskArguments::new(), EnqueueOptions::new().depends_on(a))
        .unwrap();
    let err = batch.submit().await.unwrap_err();

    assert!(matches!(err, EngineError::CyclicDependency { .. }));
    assert_eq!(engine.counts(None).await.unwrap().total(), 1);
    assert!(matches!(engine.get(a).await, Err(EngineError::NotFound(_))));

    let mut batch = engine.batch();
    let own = batch.reserve_id();
    batch
        .add_with_id(own, Noop::NAME, TaskArguments::new(), EnqueueOptions::new().depends_on(own))
        .unwrap();
    assert!(matches!(
        batch.submit().await,
        Err(EngineError::CyclicDependency { .. })
    ));
    assert_eq!(engine.counts(None).await.unwrap().total(), 1);
}

#[tokio::test]
async fn cancel_is_idempotent_and_cascades() {
    let engine = noop_builder(1).build().await.unwrap();
    let parent = engine.submit(&Noop, EnqueueOptions::new()).await.unwrap();
    let child = engine
        .submit(&Noop, EnqueueOptions::new().depends_on(parent))
        .await
        .unwrap();

    assert!(engine.cancel(parent).await.unwrap());
    assert!(!engine.cancel(parent).await.unwrap());
    assert!(!engine.cancel(child).await.unwrap());

    let view = engine.status(child).await.unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert_eq!(
        view.cancel_cause,
        Some(CancelCause::DependencyCancelled { dependency: parent })
    );

    // Submitting behind a cancelled task stores the new task cancelled.
    let late = engine
        .submit(&Noop, EnqueueOptions::new().depends_on(parent))
        .await
        .unwrap();
    assert_eq!(engine.status(late).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn batch_member_listed_before_a_cancelled_dependency_is_cancelled() {
    let engine = noop_builder(1).build().await.unwrap();
    let dead = engine.submit(&Noop, EnqueueOptions::new()).await.unwrap();
    assert!(engine.cancel(dead).await.unwrap());

    let mut batch = engine.batch();
    let a = batch.reserve_id();
    let b = batch.reserve_id();
    batch
        .add_with_id(a, Noop::NAME, TaskArguments::new(), EnqueueOptions::new().depends_on(b))
        .unwrap();
    batch
        .add_with_id(b, Noop::NAME, TaskArguments::new(), EnqueueOptions::new().depends_on(dead))
        .unwrap();
    batch.submit().await.unwrap();

    let view = engine.wait(a, Duration::from_millis(200)).await.unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert_eq!(view.cancel_cause, Some(CancelCause::DependencyCancelled { dependency: b }));
    assert_eq!(engine.counts(None).await.unwrap().pending, 0);
}

#[tokio::test]
async fn task_between_attempts_can_be_cancelled() {
    let config = EngineConfig {
        retry: RetryConfig {
            base_delay_ms: 60_000,
            multiplier: 1.0,
            max_delay_ms: 60_000,
        },
        ..fast_config(1)
    };
    let engine = noop_builder(1)
        .with_config(config)
        .register::<RenderPdf, _>(handler_fn(|_job: RenderPdf, _ctx: JobContext| async move {
            Err::<(), _>(JobError::new("renderer busy"))
        }))
        .unwrap()
        .build()
        .await
        .unwrap();

    let pdf = engine
        .submit(&RenderPdf { invoice_id: 4 }, EnqueueOptions::new().max_attempts(3))
        .await
        .unwrap();
    let email = engine
        .submit(&Noop, EnqueueOptions::new().depends_on(pdf))
        .await
        .unwrap();
    let workers = engine.start();

    tokio::time::timeout(WAIT, async {
        while engine.get(pdf).await.unwrap().attempt_count < 1
            || engine.status(pdf).await.unwrap().status == TaskStatus::Running
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(engine.cancel(pdf).await.unwrap());
    let view = engine.wait(pdf, WAIT).await.unwrap();
    workers.shutdown_and_join().await;

    assert_eq!(view.status, TaskStatus::Cancelled);
    assert_eq!(view.attempt_count, 1);
    assert_eq!(
        engine.status(email).await.unwrap().cancel_cause,
        Some(CancelCause::DependencyCancelled { dependency: pdf })
    );
}

#[tokio::test]
async fn each_task_runs_once_across_workers() {
    #[derive(Default)]
    struct Tally {
        runs: u32,
        active: u32,
        peak: u32,
    }

    let tallies: Arc<Mutex<HashMap<u64, Tally>>> = Arc::new(Mutex::new(HashMap::new()));
    let shared = Arc::clone(&tallies);
    let engine = EngineBuilder::new()
        .with_config(fast_config(8))
        .register::<RenderPdf, _>(handler_fn(move |job: RenderPdf, _ctx: JobContext| {
            let shared = Arc::clone(&shared);
            async move {
                {
                    let mut tallies = shared.lock().unwrap();
                    let t = tallies.entry(job.invoice_id).or_default();
                    t.runs += 1;
                    t.active += 1;
                    t.peak = t.peak.max(t.active);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                shared.lock().unwrap().entry(job.invoice_id).or_default().active -= 1;
                Ok::<_, JobError>(())
            }
        }))
        .unwrap()
        .build()
        .await
        .unwrap();
    let workers = engine.start();
    assert_eq!(workers.size(), 8);

    let mut ids = Vec::new();
    for invoice_id in 0..60 {
        ids.push(
            engine
                .submit(&RenderPdf { invoice_id }, EnqueueOptions::new())
                .await
                .unwrap(),
        );
    }
    for &id in &ids {
        let view = engine.wait(id, WAIT).await.unwrap();
        assert_eq!(view.attempt_count, 1);
    }
    workers.shutdown_and_join().await;

    let tallies = tallies.lock().unwrap();
    assert_eq!(tallies.len(), 60);
    assert!(tallies.values().all(|t| t.runs == 1));
    assert!(tallies.values().all(|t| t.peak == 1 && t.active == 0));
}

#[tokio::test]
async fn interrupted_work_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");

    let id = {
        let store = FileTaskStore::open(&path, Arc::new(SystemClock)).await.unwrap();
        let id = store.submit(vec![NewTask::new(Noop::NAME)]).await.unwrap()[0].id;
        store.claim(id, None).await.unwrap();
        id
    };

    let config = EngineConfig {
        store_path: Some(path),
        ..fast_config(1)
    };
    let engine = noop_builder(1).with_config(config).build().await.unwrap();
    assert_eq!(engine.status(id).await.unwrap().status, TaskStatus::Pending);

    let workers = engine.start();
    let view = engine.wait(id, WAIT).await.unwrap();
    workers.shutdown_and_join().await;

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.attempt_count, 2);
    let record = engine.get(id).await.unwrap();
    assert_eq!(record.attempts[0].outcome, Some(AttemptOutcome::Interrupted));
}

#[tokio::test]
async fn dependents_receive_upstream_results() {
    let engine = EngineBuilder::new()
        .with_config(fast_config(2))
        .register::<RenderPdf, _>(handler_fn(|job: RenderPdf, _ctx: JobContext| async move {
            Ok::<_, JobError>(format!("invoice_pdfs/invoice_{}.pdf", job.invoice_id))
        }))
        .unwrap()
        .register::<SendEmail, _>(handler_fn(|job: SendEmail, ctx: JobContext| async move {
            let document: String = ctx.dependency_result(RenderPdf::NAME)?;
            Ok::<_, JobError>(json!({"invoice_id": job.invoice_id, "attachment": document}))
        }))
        .unwrap()
        .build()
        .await
        .unwrap();

    let mut batch = engine.batch();
    let pdf = batch.add_job(&RenderPdf { invoice_id: 12 }, EnqueueOptions::new()).unwrap();
    let email = batch
        .add_job(&SendEmail { invoice_id: 12 }, EnqueueOptions::new().depends_on(pdf))
        .unwrap();
    batch.submit().await.unwrap();
    let workers = engine.start();

    engine.wait(email, WAIT).await.unwrap();
    workers.shutdown_and_join().await;

    assert_eq!(
        engine.result(email).await.unwrap(),
        json!({"invoice_id": 12, "attachment": "invoice_pdfs/invoice_12.pdf"})
    );
}
