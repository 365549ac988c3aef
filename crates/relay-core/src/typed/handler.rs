//! Handler traits: job bodies, typed and type-erased.
//!
//! - `Handler<J>`: what users implement, bound to one job type
//! - `DynHandler`: object-safe form stored in the registry
//! - `TypedHandler<J, H>`: adapts the first to the second

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::context::JobContext;
use super::job::{Job, JobDefaults, decode_arguments};
use crate::domain::{JobError, TaskArguments};

/// Runs one job type.
///
/// # Example
/// ```ignore
/// struct RenderPdf;
///
/// #[async_trait]
/// impl Handler<GenerateInvoicePdf> for RenderPdf {
///     type Output = String;
///
///     async fn handle(&self, job: GenerateInvoicePdf, _ctx: JobContext) -> Result<String, JobError> {
///         Ok(format!("/tmp/invoice_{}.pdf", job.invoice_id))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<J: Job>: Send + Sync + 'static {
    /// Stored as the task's result.
    type Output: Serialize + Send;

    async fn handle(&self, job: J, ctx: JobContext) -> Result<Self::Output, JobError>;
}

/// Object-safe handler, so handlers for different job types can share one map.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn defaults(&self) -> JobDefaults;

    /// Check that `args` decode into the job's argument type.
    fn validate(&self, args: &TaskArguments) -> Result<(), String>;

    async fn call(&self, args: TaskArguments, ctx: JobContext) -> Result<Value, JobError>;
}

pub struct TypedHandler<J: Job, H: Handler<J>> {
    handler: H,
    _marker: PhantomData<fn(J)>,
}

impl<J: Job, H: Handler<J>> TypedHandler<J, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job, H: Handler<J>> DynHandler for TypedHandler<J, H> {
    fn name(&self) -> &'static str {
        J::NAME
    }

    fn defaults(&self) -> JobDefaults {
        JobDefaults::of::<J>()
    }

    fn validate(&self, args: &TaskArguments) -> Result<(), String> {
        decode_arguments::<J>(args).map(|_| ())
    }

    async fn call(&self, args: TaskArguments, ctx: JobContext) -> Result<Value, JobError> {
        let job = decode_arguments::<J>(&args)
            .map_err(|e| JobError::permanent(format!("arguments for '{}': {e}", J::NAME)))?;
        let output = self.handler.handle(job, ctx).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// builder.register::<DailyReport, _>(handler_fn(|_job: DailyReport, _ctx| async { Ok(0u32) }))?;
/// ```
pub fn handler_fn<J, F, Fut, O>(f: F) -> FnHandler<F>
where
    J: Job,
    F: Fn(J, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, JobError>> + Send + 'static,
    O: Serialize + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<J, F, Fut, O> Handler<J> for FnHandler<F>
where
    J: Job,
    F: Fn(J, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, JobError>> + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Output = O;

    async fn handle(&self, job: J, ctx: JobContext) -> Result<O, JobError> {
        (self.f)(job, ctx).await
    }
}
