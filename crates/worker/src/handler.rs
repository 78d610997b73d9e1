//! Job handler abstraction.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::job::{Job, JobContext};

/// Business logic invoked for every job of one topic.
///
/// Handlers only see the job; acknowledgement is the engine's job and happens
/// after `handle` returns `Ok`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError>;
}

/// Handler shared between the router and every worker.
pub type SharedHandler = Arc<dyn JobHandler>;

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
        (**self).handle(ctx, job).await
    }
}

/// Adapter turning a synchronous closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a synchronous closure as a handler.
///
/// ```ignore
/// let h = handler_fn(|_ctx, job| {
///     println!("{}", job.topic());
///     Ok(())
/// });
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&JobContext, &Job) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobContext, &Job) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
        (self.f)(ctx, job)
    }
}
