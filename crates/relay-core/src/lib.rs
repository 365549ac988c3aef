//! relay-core
//!
//! Durable, priority-ordered, dependency-aware background task scheduling.
//!
//! # Modules
//! - **domain**: ids, priorities, statuses, task records, decisions, errors
//! - **queue**: dependency graph, readiness, retry backoff, the task table
//! - **ports**: `TaskStore`, `Clock`, `IdGenerator`
//! - **impls**: in-memory and file-backed task stores
//! - **typed**: `Job` / `Handler` traits and the job registry
//! - **app**: engine, dispatcher, executor, worker pool
//! - **config**: TOML configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{Batch, BuildError, Engine, EngineBuilder, WorkerPool};
pub use config::{ConfigError, EngineConfig, QueueConfig, RetryConfig};
pub use domain::{
    CancelCause, EngineError, EnqueueOptions, JobError, Priority, QueueCounts, TaskArguments,
    TaskId, TaskRecord, TaskStatus, TaskStatusView,
};
pub use queue::TaskFilter;
pub use typed::{Handler, Job, JobContext, handler_fn};
