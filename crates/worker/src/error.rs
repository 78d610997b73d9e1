//! Error taxonomy of the processing engine.
//!
//! Only [`EngineError`] is surfaced by the lifecycle. Handler, ack and schedule
//! failures are logged by the engine and never retried.

use thiserror::Error;

use incentive_core::CoreError;

/// A job handler failed; the job is dropped without acknowledgement.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("decode payload: {0}")]
    Decode(String),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Committing a processed message back to the transport failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("commit failed: {0}")]
    Commit(String),
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("close failed: {0}")]
    Close(String),

    #[error("listener is already listening")]
    AlreadyListening,
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("no topic given and no default topic configured")]
    MissingTopic,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("producer closed")]
    Closed,
}

/// Failure of the external counting store backing a usage counter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum UsageError {
    /// Returned to the caller; not an engine fault.
    #[error("max usage reached {used}/{max}")]
    QuotaExceeded { used: u32, max: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    InvalidClock(#[from] CoreError),

    #[error("schedule frequency must be greater than zero")]
    ZeroFrequency,

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScheduleError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The listener could not subscribe; `run` is aborted.
    #[error("listener failed to start: {0}")]
    Startup(#[source] ListenerError),

    /// The listener failed to close; the queue was still closed and drained.
    #[error("listener failed to close: {0}")]
    Shutdown(#[source] ListenerError),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is not running")]
    NotRunning,

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),
}
