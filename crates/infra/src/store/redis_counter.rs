//! Usage counters in Redis: `GET` to read, `SET .. PX` to write with the reset expiry.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use incentive_worker::{CountingStore, StoreError};

#[derive(Clone)]
pub struct RedisCountingStore {
    conn: MultiplexedConnection,
}

impl RedisCountingStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

/// Expiry in whole milliseconds, never zero (Redis rejects a zero TTL).
fn expiry_millis(expiry: Duration) -> u64 {
    u64::try_from(expiry.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn parse_count(key: &str, raw: Option<String>) -> Result<u32, StoreError> {
    match raw {
        None => Ok(0),
        Some(raw) => raw.trim().parse().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("not a count: {raw:?}"),
        }),
    }
}

#[async_trait]
impl CountingStore for RedisCountingStore {
    async fn count(&self, key: &str) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StoreError::Unavailable(format!("GET {key}: {e}")))?;
        parse_count(key, raw)
    }

    async fn update(&self, key: &str, value: u32, expiry: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(expiry_millis(expiry))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("SET {key}: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisCountingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RedisCountingStore")
    }
}
