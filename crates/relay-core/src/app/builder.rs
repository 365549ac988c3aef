//! EngineBuilder: wiring and startup validation.

use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::engine::{Engine, EngineInner};
use super::executor::Executor;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{Decider, DefaultDecider, EngineError};
use crate::impls::{FileTaskStore, InMemoryTaskStore};
use crate::ports::{Clock, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{Handler, Job, JobRegistry, RegistryError};

/// Builds an `Engine`.
///
/// # Example
/// ```ignore
/// let engine = EngineBuilder::new()
///     .with_config(EngineConfig::from_toml_file("relay.toml")?)
///     .register::<GenerateInvoice, _>(GenerateInvoiceHandler)?
///     .expect_jobs(&["generate_invoice", "send_invoice_email"])
///     .build()
///     .await?;
/// ```
///
/// # Fail-fast
/// - `register` rejects a second handler for the same job name
/// - `build` checks that every name given to `expect_jobs` is registered
/// - `build` validates the configuration and opens the store
pub struct EngineBuilder {
    registry: JobRegistry,
    expected_jobs: Option<Vec<String>>,
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn Decider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing jobs: {0:?}; these jobs were expected but not registered")]
    MissingJobs(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open task store: {0}")]
    Store(#[from] EngineError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: JobRegistry::new(),
            expected_jobs: None,
            config: EngineConfig::default(),
            store: None,
            clock: Arc::new(SystemClock),
            decider: None,
        }
    }

    pub fn register<J: Job, H: Handler<J>>(mut self, handler: H) -> Result<Self, RegistryError> {
        self.registry.register::<J, H>(handler)?;
        Ok(self)
    }

    /// Job names that must be registered by the time `build` runs.
    pub fn expect_jobs(mut self, names: &[&str]) -> Self {
        self.expected_jobs = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this store instead of the one `config.store_path` would open.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default retry decider.
    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub async fn build(self) -> Result<Engine, BuildError> {
        if let Some(expected) = &self.expected_jobs {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobs(missing));
            }
        }
        self.config.validate()?;

        let store: Arc<dyn TaskStore> = match (self.store, &self.config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileTaskStore::open(path, Arc::clone(&self.clock)).await?),
            (None, None) => Arc::new(InMemoryTaskStore::with_clock(Arc::clone(&self.clock))),
        };
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry_policy())));
        let registry = Arc::new(self.registry);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&self.clock),
            self.config.queue_limits(),
            self.config.poll_interval(),
        ));
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            decider,
            Arc::clone(&self.clock),
        ));

        Ok(Engine::from_inner(EngineInner {
            store,
            registry,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
            config: self.config,
            dispatcher,
            executor,
        }))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnqueueOptions, JobError, Priority, TaskArguments, TaskStatus};
    use crate::typed::{JobContext, handler_fn};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct GenerateInvoice {
        customer_id: u64,
    }

    impl Job for GenerateInvoice {
        const NAME: &'static str = "generate_invoice";
        const QUEUE: &'static str = "invoices";
        const PRIORITY: Priority = Priority::High;
        const MAX_ATTEMPTS: Option<u32> = Some(5);
    }

    fn builder() -> EngineBuilder {
        EngineBuilder::new()
            .register::<GenerateInvoice, _>(handler_fn(
                |job: GenerateInvoice, _ctx: JobContext| async move { Ok::<_, JobError>(job.customer_id) },
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn build_success() {
        let engine = builder().expect_jobs(&["generate_invoice"]).build().await;
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn build_missing_jobs() {
        let result = builder()
            .expect_jobs(&["generate_invoice", "send_invoice_email"])
            .build()
            .await;
        assert!(matches!(
            result,
            Err(BuildError::MissingJobs(missing)) if missing == vec!["send_invoice_email".to_string()]
        ));
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let config = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        let result = builder().with_config(config).build().await;
        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[tokio::test]
    async fn job_defaults_apply_unless_overridden() {
        let engine = builder().build().await.unwrap();

        let id = engine
            .submit(&GenerateInvoice { customer_id: 1 }, EnqueueOptions::new())
            .await
            .unwrap();
        let r = engine.get(id).await.unwrap();
        assert_eq!((r.queue.as_str(), r.priority, r.max_attempts), ("invoices", Priority::High, 5));

        let id = engine
            .submit(
                &GenerateInvoice { customer_id: 2 },
                EnqueueOptions::new().queue("urgent").priority(Priority::Low).max_attempts(1),
            )
            .await
            .unwrap();
        let r = engine.get(id).await.unwrap();
        assert_eq!((r.queue.as_str(), r.priority, r.max_attempts), ("urgent", Priority::Low, 1));
    }

    #[tokio::test]
    async fn submission_is_validated() {
        let engine = builder().build().await.unwrap();

        let err = engine
            .enqueue("no_such_job", TaskArguments::new(), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownJob(name) if name == "no_such_job"));

        let err = engine
            .enqueue(
                "generate_invoice",
                TaskArguments::new().with_named("customer", 1),
                EnqueueOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArguments { .. }));
        assert_eq!(engine.counts(None).await.unwrap().total(), 0);
    }

    #[derive(Serialize, Deserialize)]
    struct ReconcilePayments {}

    impl Job for ReconcilePayments {
        const NAME: &'static str = "reconcile_payments";
    }

    #[tokio::test]
    async fn job_without_fields_can_be_submitted() {
        let engine = builder()
            .register::<ReconcilePayments, _>(handler_fn(
                |_job: ReconcilePayments, _ctx: JobContext| async move { Ok::<_, JobError>(()) },
            ))
            .unwrap()
            .build()
            .await
            .unwrap();

        let id = engine
            .submit(&ReconcilePayments {}, EnqueueOptions::new())
            .await
            .unwrap();
        let r = engine.get(id).await.unwrap();
        assert!(r.arguments.is_empty());
        assert_eq!(r.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn result_reports_why_a_task_did_not_complete() {
        let engine = builder().build().await.unwrap();
        let id = engine
            .enqueue("generate_invoice", TaskArguments::new().with_arg(3), EnqueueOptions::new())
            .await
            .unwrap();

        assert!(matches!(
            engine.result(id).await,
            Err(EngineError::NotFinished { status: TaskStatus::Pending, .. })
        ));
        assert!(engine.cancel(id).await.unwrap());
        assert!(!engine.cancel(id).await.unwrap());
        assert!(matches!(engine.result(id).await, Err(EngineError::Cancelled(_))));
    }
}
