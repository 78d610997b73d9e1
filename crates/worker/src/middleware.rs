//! Handler decorators.
//!
//! A middleware takes a handler and returns a new handler. The engine composes
//! every registered middleware around every route once, before the first job
//! is dispatched. Index 0 of the pipeline is the outermost layer, so it sees
//! the job first and the result last.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, info, info_span, warn};

use crate::error::HandlerError;
use crate::handler::{JobHandler, SharedHandler};
use crate::job::{Job, JobContext};

pub trait Middleware: Send + Sync {
    fn wrap(&self, next: SharedHandler) -> SharedHandler;
}

impl<M> Middleware for Arc<M>
where
    M: Middleware + ?Sized,
{
    fn wrap(&self, next: SharedHandler) -> SharedHandler {
        (**self).wrap(next)
    }
}

struct FnMiddleware<F> {
    f: F,
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(SharedHandler) -> SharedHandler + Send + Sync,
{
    fn wrap(&self, next: SharedHandler) -> SharedHandler {
        (self.f)(next)
    }
}

/// Build a middleware from a `handler -> handler` closure.
pub fn middleware_fn<F>(f: F) -> impl Middleware
where
    F: Fn(SharedHandler) -> SharedHandler + Send + Sync + 'static,
{
    FnMiddleware { f }
}

/// Ordered list of middleware.
#[derive(Clone, Default)]
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer. Later layers sit closer to the handler.
    pub fn push(&mut self, layer: impl Middleware + 'static) {
        self.layers.push(Arc::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Compose all layers around `handler`.
    ///
    /// For layers `[m0, m1, m2]` the result is `m0(m1(m2(handler)))`.
    pub fn apply(&self, handler: SharedHandler) -> SharedHandler {
        self.layers
            .iter()
            .rev()
            .fold(handler, |next, layer| layer.wrap(next))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("layers", &self.layers.len())
            .finish()
    }
}

/// Logs every job outcome with its elapsed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

struct Logged {
    next: SharedHandler,
}

#[async_trait]
impl JobHandler for Logged {
    async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
        let started = Instant::now();
        let result = self.next.handle(ctx, job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(
                topic = job.topic(),
                worker_id = ctx.worker_id(),
                elapsed_ms,
                "job handled"
            ),
            Err(e) => warn!(
                topic = job.topic(),
                worker_id = ctx.worker_id(),
                elapsed_ms,
                error = %e,
                "job failed"
            ),
        }

        result
    }
}

impl Middleware for LoggingMiddleware {
    fn wrap(&self, next: SharedHandler) -> SharedHandler {
        Arc::new(Logged { next })
    }
}

/// Runs the wrapped handler inside a `job` span carrying topic and worker id.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

struct Traced {
    next: SharedHandler,
}

#[async_trait]
impl JobHandler for Traced {
    async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
        let span = info_span!(
            "job",
            topic = job.topic(),
            worker_id = ctx.worker_id(),
            payload_bytes = job.payload().len()
        );
        self.next.handle(ctx, job).instrument(span).await
    }
}

impl Middleware for TracingMiddleware {
    fn wrap(&self, next: SharedHandler) -> SharedHandler {
        Arc::new(Traced { next })
    }
}
