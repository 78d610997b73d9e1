//! Jobs pulled from the stream and their acknowledgement capability.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{AckError, HandlerError};

/// Future returned by an acknowledgement commit.
pub type AckFuture = Pin<Box<dyn Future<Output = Result<(), AckError>> + Send>>;

type CommitFn = Box<dyn FnOnce() -> AckFuture + Send + Sync>;

/// Single-use acknowledgement bound to the original message (e.g. an offset commit).
///
/// Committing consumes the `Ack`, so a message can never be acknowledged twice.
pub struct Ack {
    commit: CommitFn,
}

impl Ack {
    pub fn new<F, Fut>(commit: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AckError>> + Send + 'static,
    {
        Self {
            commit: Box::new(move || Box::pin(commit())),
        }
    }

    /// An acknowledgement for transports that have nothing to commit.
    pub fn noop() -> Self {
        Self::new(|| async { Ok(()) })
    }

    pub async fn commit(self) -> Result<(), AckError> {
        (self.commit)().await
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ack(..)")
    }
}

/// One unit of work: a topic, an opaque payload and the acknowledgement for it.
///
/// Owned by exactly one worker once dequeued.
#[derive(Debug)]
pub struct Job {
    topic: String,
    payload: Vec<u8>,
    ack: Ack,
}

impl Job {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, ack: Ack) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ack,
        }
    }

    /// A job whose acknowledgement is a no-op.
    pub fn unacked(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(topic, payload, Ack::noop())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode a JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.payload).map_err(|e| HandlerError::decode(e.to_string()))
    }

    /// Acknowledge the job, consuming it.
    pub async fn ack(self) -> Result<(), AckError> {
        self.ack.commit().await
    }

    pub fn into_parts(self) -> (String, Vec<u8>, Ack) {
        (self.topic, self.payload, self.ack)
    }
}

/// Per-worker execution context handed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    worker_id: usize,
    shutdown: CancellationToken,
}

impl JobContext {
    pub fn new(worker_id: usize, shutdown: CancellationToken) -> Self {
        Self {
            worker_id,
            shutdown,
        }
    }

    /// A context not tied to any engine (tests, direct handler calls).
    pub fn detached() -> Self {
        Self::new(0, CancellationToken::new())
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Cancelled once the engine starts stopping.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn ack_runs_commit_once() {
        let commits = Arc::new(AtomicUsize::new(0));
        let counter = commits.clone();
        let job = Job::new(
            "trips",
            b"{}".to_vec(),
            Ack::new(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        job.ack().await.unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ack_error_is_returned() {
        let job = Job::new(
            "trips",
            Vec::new(),
            Ack::new(|| async { Err(AckError::Commit("broker gone".to_string())) }),
        );

        assert_eq!(
            job.ack().await,
            Err(AckError::Commit("broker gone".to_string()))
        );
    }

    #[test]
    fn decode_reports_bad_json() {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Trip {
            driver_id: String,
        }

        let job = Job::unacked("trips", b"not json".to_vec());
        assert!(matches!(job.decode::<Trip>(), Err(HandlerError::Decode(_))));

        let job = Job::unacked("trips", br#"{"driver_id":"d-1"}"#.to_vec());
        assert_eq!(job.decode::<Trip>().unwrap().driver_id, "d-1");
    }

    #[test]
    fn detached_context_is_not_shutting_down() {
        let ctx = JobContext::detached();
        assert_eq!(ctx.worker_id(), 0);
        assert!(!ctx.is_shutting_down());
    }
}
