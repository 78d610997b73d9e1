//! `incentive-worker` — topic-routed job processing engine.
//!
//! ## Components
//!
//! - [`Job`] / [`Ack`]: one message pulled from a stream, with a single-use acknowledgement
//! - [`JobHandler`]: business logic for one topic
//! - [`Middleware`] / [`Pipeline`]: handler decorators (index 0 is outermost)
//! - [`RouterBuilder`] / [`Router`]: topic → handler table, frozen before start
//! - [`Listener`] / [`Producer`]: the stream transport contracts consumed by the engine and handlers
//! - [`Engine`]: bounded queue + fixed worker pool + recurring [`Schedule`]s under one lifecycle
//! - [`UsageCounter`]: keyed quota with a daily reset at a clock time
//!
//! ## Delivery policy
//!
//! A job is acknowledged only after its handler succeeds. Handler failures and
//! unrouted topics drop the job without acknowledgement; redelivery is left to
//! the transport. Nothing here retries.

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod in_memory;
pub mod job;
pub mod listener;
pub mod middleware;
pub mod router;
pub mod schedule;
pub mod stats;
pub mod usage;

pub use config::{EngineConfig, EngineMode, DEFAULT_QUEUE_CAPACITY};
pub use engine::{Engine, EngineBuilder, EngineState};
pub use error::{
    AckError, EngineError, HandlerError, ListenerError, ProducerError, ScheduleError, StoreError,
    UsageError,
};
pub use handler::{handler_fn, FnHandler, JobHandler, SharedHandler};
pub use in_memory::{InMemoryBroker, InMemoryCountingStore, Published};
pub use job::{Ack, Job, JobContext};
pub use listener::{JobSink, Listener, Producer, SinkClosed, StopFn};
pub use middleware::{middleware_fn, LoggingMiddleware, Middleware, Pipeline, TracingMiddleware};
pub use router::{Router, RouterBuilder};
pub use schedule::{action_fn, Schedule, ScheduleContext, ScheduledAction};
pub use stats::{EngineStats, StatsSnapshot};
pub use usage::{CountingStore, UsageCounter};
