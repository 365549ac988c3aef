//! Queue module: dependency graph, readiness, retry backoff, and the task table.

mod dependency;
mod resolver;
mod retry;
mod table;

pub use dependency::DependencyGraph;
pub use resolver::{DependencyResolver, Readiness, StatusSnapshot};
pub use retry::RetryPolicy;
pub use table::{ClaimOutcome, Recovery, TaskFilter, TaskTable, UpdateOutcome};
