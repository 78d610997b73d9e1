//! Stream transport contracts.
//!
//! A [`Listener`] pushes jobs for a set of topics into the engine's queue. A
//! [`Producer`] publishes messages; handlers use it to emit follow-up events.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::{ListenerError, ProducerError};
use crate::job::Job;

/// The engine's queue was closed; the listener should stop forwarding.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("job queue closed")]
pub struct SinkClosed;

/// Sending half of the engine's bounded job queue.
///
/// `send` waits while the queue is full, which is how backpressure reaches the
/// listener.
#[derive(Debug, Clone)]
pub struct JobSink {
    tx: mpsc::Sender<Job>,
}

impl JobSink {
    pub fn new(tx: mpsc::Sender<Job>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, job: Job) -> Result<(), SinkClosed> {
        self.tx.send(job).await.map_err(|_| SinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Free slots right now.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Callback the engine invokes once all workers have exited.
pub type StopFn = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait Listener: Send + Sync {
    /// Start delivering jobs for `topics` into `sink`.
    ///
    /// Returns a stop callback on success. An error aborts engine startup.
    async fn listen(&self, topics: Vec<String>, sink: JobSink) -> Result<StopFn, ListenerError>;

    /// Close the underlying connection.
    async fn close(&self) -> Result<(), ListenerError>;
}

#[async_trait]
impl<L> Listener for Arc<L>
where
    L: Listener + ?Sized,
{
    async fn listen(&self, topics: Vec<String>, sink: JobSink) -> Result<StopFn, ListenerError> {
        (**self).listen(topics, sink).await
    }

    async fn close(&self) -> Result<(), ListenerError> {
        (**self).close().await
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Publish `value` under `key` to `topic`, or to the producer's default
    /// topic when `topic` is `None`.
    async fn produce(
        &self,
        key: &[u8],
        value: &[u8],
        topic: Option<&str>,
    ) -> Result<(), ProducerError>;
}

#[async_trait]
impl<P> Producer for Arc<P>
where
    P: Producer + ?Sized,
{
    async fn produce(
        &self,
        key: &[u8],
        value: &[u8],
        topic: Option<&str>,
    ) -> Result<(), ProducerError> {
        (**self).produce(key, value, topic).await
    }
}
