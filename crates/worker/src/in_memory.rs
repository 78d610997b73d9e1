//! In-process broker and counting store.
//!
//! Useful for tests and local runs. The broker behaves like a stream with a
//! single consumer: published messages are forwarded to the engine's queue in
//! order, and acknowledgements are recorded per message id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AckError, ListenerError, ProducerError, StoreError};
use crate::job::{Ack, Job};
use crate::listener::{JobSink, Listener, Producer, StopFn};
use crate::usage::CountingStore;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub id: u64,
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

pub struct InMemoryBroker {
    inbox: mpsc::UnboundedSender<Published>,
    outbox: Mutex<Option<mpsc::UnboundedReceiver<Published>>>,
    next_id: AtomicU64,
    published: Mutex<Vec<Published>>,
    acked: Arc<Mutex<Vec<u64>>>,
    subscriptions: Mutex<Vec<String>>,
    stop_calls: Arc<AtomicUsize>,
    closed: AtomicBool,
    cancel: CancellationToken,
    default_topic: Option<String>,
    fail_acks: bool,
    fail_close: bool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (inbox, outbox) = mpsc::unbounded_channel();
        Self {
            inbox,
            outbox: Mutex::new(Some(outbox)),
            next_id: AtomicU64::new(1),
            published: Mutex::new(Vec::new()),
            acked: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Mutex::new(Vec::new()),
            stop_calls: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            default_topic: None,
            fail_acks: false,
            fail_close: false,
        }
    }

    /// Topic used by [`Producer::produce`] when none is given.
    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    /// Every acknowledgement fails with [`AckError::Commit`].
    pub fn with_failing_acks(mut self) -> Self {
        self.fail_acks = true;
        self
    }

    /// `close` reports an error (after stopping delivery).
    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Enqueue a message and return its id.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> u64 {
        self.publish_keyed(topic, Vec::<u8>::new(), payload)
    }

    fn publish_keyed(
        &self,
        topic: impl Into<String>,
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> u64 {
        let message = Published {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
        };
        let id = message.id;

        lock(&self.published).push(message.clone());
        if self.inbox.send(message).is_err() {
            debug!(id, "broker delivery stopped; message kept in log only");
        }
        id
    }

    /// Ids acknowledged so far, in ack order.
    pub fn acked(&self) -> Vec<u64> {
        lock(&self.acked).clone()
    }

    pub fn is_acked(&self, id: u64) -> bool {
        lock(&self.acked).contains(&id)
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }

    /// Topics passed to the last `listen` call.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    /// How many times the stop callback returned by `listen` has run.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn ack_for(id: u64, acked: Arc<Mutex<Vec<u64>>>, fail: bool) -> Ack {
    if fail {
        return Ack::new(move || async move {
            Err(AckError::Commit(format!("message {id} rejected")))
        });
    }

    Ack::new(move || async move {
        lock(&acked).push(id);
        Ok(())
    })
}

#[async_trait]
impl Listener for InMemoryBroker {
    async fn listen(&self, topics: Vec<String>, sink: JobSink) -> Result<StopFn, ListenerError> {
        let mut outbox = lock(&self.outbox)
            .take()
            .ok_or(ListenerError::AlreadyListening)?;
        *lock(&self.subscriptions) = topics;

        let cancel = self.cancel.clone();
        let acked = self.acked.clone();
        let fail_acks = self.fail_acks;

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    message = outbox.recv() => match message {
                        Some(m) => m,
                        None => break,
                    },
                };

                let ack = ack_for(message.id, acked.clone(), fail_acks);
                let job = Job::new(message.topic, message.payload, ack);

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = sink.send(job) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            debug!("in-memory broker forwarder exited");
        });

        let stop_calls = self.stop_calls.clone();
        Ok(Box::new(move || {
            stop_calls.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn close(&self) -> Result<(), ListenerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        if self.fail_close {
            return Err(ListenerError::Close("in-memory broker close failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Producer for InMemoryBroker {
    async fn produce(
        &self,
        key: &[u8],
        value: &[u8],
        topic: Option<&str>,
    ) -> Result<(), ProducerError> {
        if self.is_closed() {
            return Err(ProducerError::Closed);
        }

        let topic = topic
            .or(self.default_topic.as_deref())
            .ok_or(ProducerError::MissingTopic)?
            .to_string();
        self.publish_keyed(topic, key, value);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("published", &lock(&self.published).len())
            .field("acked", &lock(&self.acked).len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Counting store keeping values in a map with per-key expiry.
#[derive(Debug, Default)]
pub struct InMemoryCountingStore {
    entries: Mutex<HashMap<String, (u32, Instant)>>,
}

impl InMemoryCountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left before `key` expires, if it is present.
    pub fn expiry_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        lock(&self.entries)
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(_, expires_at)| *expires_at - now)
    }
}

#[async_trait]
impl CountingStore for InMemoryCountingStore {
    async fn count(&self, key: &str) -> Result<u32, StoreError> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(*value),
            Some(_) => {
                entries.remove(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn update(&self, key: &str, value: u32, expiry: Duration) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), (value, Instant::now() + expiry));
        Ok(())
    }
}
