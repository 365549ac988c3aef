//! Typed job API.
//!
//! Job names are bound to argument types at compile time; the registry
//! stores type-erased handlers so one map serves every job.

pub mod context;
pub mod handler;
pub mod job;
pub mod registry;

pub use self::context::{DependencyResult, DependencyResults, JobContext};
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler, handler_fn};
pub use self::job::{Job, JobDefaults, decode_arguments};
pub use self::registry::{JobRegistry, RegistryError};
