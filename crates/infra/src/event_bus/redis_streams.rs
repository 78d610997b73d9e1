//! Redis Streams transport (durable, at-least-once delivery).
//!
//! - **Streams**: one stream per topic, keyed by the topic name
//! - **Consumer group**: shared by every worker process (`CONSUMER_GROUP`)
//! - **Consumer name**: unique per process unless configured
//! - **Ack**: `XACK` after the handler succeeds; anything else stays pending
//!   in the group and is read again by a consumer with the same name
//!
//! Entries carry two fields, `key` and `value`. The job payload is `value`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use incentive_worker::{
    Ack, AckError, Job, JobSink, Listener, ListenerError, Producer, ProducerError, StopFn,
};

const FIELD_KEY: &str = "key";
const FIELD_VALUE: &str = "value";

/// Default consumer group name.
pub const DEFAULT_GROUP: &str = "incentive-worker";

/// Read loop settings.
#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub group: String,
    /// Consumer name inside the group. Generated when `None`.
    pub consumer: Option<String>,
    /// Max entries per `XREADGROUP`.
    pub batch: usize,
    /// `XREADGROUP BLOCK` timeout.
    pub block: Duration,
    /// Pause after a failed read before trying again.
    pub retry_backoff: Duration,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            consumer: None,
            batch: 10,
            block: Duration::from_millis(1000),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl RedisStreamsConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }
}

pub struct RedisStreamsListener {
    client: redis::Client,
    config: RedisStreamsConfig,
    consumer: String,
    cancel: Mutex<Option<CancellationToken>>,
}

impl RedisStreamsListener {
    pub fn new(redis_url: impl AsRef<str>, config: RedisStreamsConfig) -> Result<Self, ListenerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ListenerError::Connection(e.to_string()))?;
        let consumer = config
            .consumer
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::now_v7()));

        Ok(Self {
            client,
            config,
            consumer,
            cancel: Mutex::new(None),
        })
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Create the consumer group on `stream` if missing (idempotent).
    async fn ensure_group(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
    ) -> Result<(), ListenerError> {
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(stream, &self.config.group, "0")
            .await;

        match created {
            Ok(()) => {
                debug!(stream, group = %self.config.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(ListenerError::Subscribe(format!(
                "XGROUP CREATE {stream} {}: {e}",
                self.config.group
            ))),
        }
    }
}

#[async_trait]
impl Listener for RedisStreamsListener {
    async fn listen(&self, topics: Vec<String>, sink: JobSink) -> Result<StopFn, ListenerError> {
        if topics.is_empty() {
            warn!("redis listener started without topics");
        }

        let mut control = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ListenerError::Connection(e.to_string()))?;
        for topic in &topics {
            self.ensure_group(&mut control, topic).await?;
        }

        // XREADGROUP BLOCK holds its connection; acks go over `control`.
        let reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ListenerError::Connection(e.to_string()))?;

        let cancel = {
            let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return Err(ListenerError::AlreadyListening);
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let read_loop = ReadLoop {
            reader,
            acks: control,
            topics: topics.clone(),
            group: self.config.group.clone(),
            consumer: self.consumer.clone(),
            config: self.config.clone(),
            sink,
            cancel,
        };
        tokio::spawn(read_loop.run());

        info!(
            topics = ?topics,
            group = %self.config.group,
            consumer = %self.consumer,
            "redis streams listener started"
        );

        let consumer = self.consumer.clone();
        Ok(Box::new(move || {
            info!(consumer = %consumer, "redis streams listener stopped");
        }))
    }

    async fn close(&self) -> Result<(), ListenerError> {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }
}

struct ReadLoop {
    reader: MultiplexedConnection,
    acks: MultiplexedConnection,
    topics: Vec<String>,
    group: String,
    consumer: String,
    config: RedisStreamsConfig,
    sink: JobSink,
    cancel: CancellationToken,
}

impl ReadLoop {
    async fn run(mut self) {
        if self.topics.is_empty() {
            return;
        }

        let cancel = self.cancel.clone();

        // Entries delivered to this consumer earlier but never acked come
        // first, walked once from the start of its pending list.
        let mut backlog: Option<Vec<String>> = Some(vec!["0".to_string(); self.topics.len()]);

        loop {
            let cursors = match &backlog {
                Some(cursors) => cursors.clone(),
                None => vec![">".to_string(); self.topics.len()],
            };
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = self.read(&cursors, backlog.is_none()) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "XREADGROUP failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_backoff) => continue,
                    }
                }
            };

            if backlog.is_some() && entries.is_empty() {
                debug!(consumer = %self.consumer, "pending backlog drained");
                backlog = None;
                continue;
            }
            if let Some(cursors) = backlog.as_mut() {
                for (stream, entry) in &entries {
                    if let Some(i) = self.topics.iter().position(|t| t == stream) {
                        cursors[i] = entry.id.clone();
                    }
                }
            }

            for (stream, entry) in entries {
                let Some(job) = self.to_job(stream, entry) else {
                    continue;
                };

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = self.sink.send(job) => sent,
                };
                if sent.is_err() {
                    debug!("job queue closed; redis read loop exiting");
                    return;
                }
            }
        }

        debug!("redis read loop cancelled");
    }

    async fn read(
        &mut self,
        cursors: &[String],
        block: bool,
    ) -> Result<Vec<(String, StreamId)>, RedisError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.config.batch);
        if block {
            opts = opts.block(self.config.block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = self
            .reader
            .xread_options(&self.topics, cursors, &opts)
            .await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| {
                        let stream = key.key;
                        key.ids.into_iter().map(move |id| (stream.clone(), id))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn to_job(&self, stream: String, entry: StreamId) -> Option<Job> {
        let ack = self.ack_for(&stream, &entry.id);

        let Some(payload) = entry.get::<Vec<u8>>(FIELD_VALUE) else {
            // Nothing a handler could do with it; ack so it leaves the pending list.
            warn!(stream = %stream, id = %entry.id, "stream entry without value field; skipped");
            tokio::spawn(async move {
                if let Err(e) = ack.commit().await {
                    error!(error = %e, "ack of malformed entry failed");
                }
            });
            return None;
        };

        Some(Job::new(stream, payload, ack))
    }

    fn ack_for(&self, stream: &str, id: &str) -> Ack {
        let mut conn = self.acks.clone();
        let stream = stream.to_string();
        let group = self.group.clone();
        let id = id.to_string();

        Ack::new(move || async move {
            let _: i64 = conn
                .xack(&stream, &group, &[&id])
                .await
                .map_err(|e| AckError::Commit(format!("XACK {stream} {id}: {e}")))?;
            Ok(())
        })
    }
}

pub struct RedisStreamsProducer {
    conn: MultiplexedConnection,
    default_topic: Option<String>,
}

impl RedisStreamsProducer {
    pub async fn connect(
        redis_url: impl AsRef<str>,
        default_topic: Option<String>,
    ) -> Result<Self, ProducerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ProducerError::Publish(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ProducerError::Publish(e.to_string()))?;

        Ok(Self {
            conn,
            default_topic,
        })
    }
}

#[async_trait]
impl Producer for RedisStreamsProducer {
    async fn produce(
        &self,
        key: &[u8],
        value: &[u8],
        topic: Option<&str>,
    ) -> Result<(), ProducerError> {
        let topic = topic
            .or(self.default_topic.as_deref())
            .ok_or(ProducerError::MissingTopic)?;

        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(topic, "*", &[(FIELD_KEY, key), (FIELD_VALUE, value)])
            .await
            .map_err(|e| ProducerError::Publish(format!("XADD {topic}: {e}")))?;

        debug!(topic, id = %id, "message published");
        Ok(())
    }
}

impl std::fmt::Debug for RedisStreamsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsListener")
            .field("group", &self.config.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_overrides() {
        let config = RedisStreamsConfig::default();
        assert_eq!(config.group, DEFAULT_GROUP);
        assert!(config.consumer.is_none());

        let config = config.with_group("g").with_consumer("worker-1");
        assert_eq!(config.group, "g");
        assert_eq!(config.consumer.as_deref(), Some("worker-1"));
    }

    #[test]
    fn generated_consumer_names_are_unique() {
        let a = RedisStreamsListener::new("redis://127.0.0.1/", RedisStreamsConfig::default()).unwrap();
        let b = RedisStreamsListener::new("redis://127.0.0.1/", RedisStreamsConfig::default()).unwrap();
        assert_ne!(a.consumer(), b.consumer());
        assert!(a.consumer().starts_with("consumer-"));

        let named = RedisStreamsListener::new(
            "redis://127.0.0.1/",
            RedisStreamsConfig::default().with_consumer("worker-1"),
        )
        .unwrap();
        assert_eq!(named.consumer(), "worker-1");
    }

    #[test]
    fn rejects_bad_url() {
        assert!(matches!(
            RedisStreamsListener::new("not a url", RedisStreamsConfig::default()),
            Err(ListenerError::Connection(_))
        ));
    }
}
