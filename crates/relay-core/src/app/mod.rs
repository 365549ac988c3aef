//! App: wires ports and the typed layer into a running scheduler.
//!
//! - **EngineBuilder**: registration, configuration, startup validation
//! - **Engine**: submission, status, cancellation
//! - **Dispatcher**: selects and claims the next eligible task
//! - **Executor**: runs a job body and records its outcome
//! - **WorkerPool**: concurrent workers (lease -> execute)

pub mod builder;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod worker_pool;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::dispatcher::{Dispatcher, select_next};
pub use self::engine::{Batch, Engine};
pub use self::executor::Executor;
pub use self::worker_pool::WorkerPool;
