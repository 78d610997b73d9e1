//! Keyed usage quota with a daily reset at a clock time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use incentive_core::{Clock, LocalClock, ResetClock, compute_reset_offset};

use crate::error::{StoreError, UsageError};

/// External store holding per-key counters with expiry.
#[async_trait]
pub trait CountingStore: Send + Sync {
    /// Current count for `key`; a missing key counts as zero.
    async fn count(&self, key: &str) -> Result<u32, StoreError>;

    /// Persist `value` for `key`, expiring after `expiry`.
    async fn update(&self, key: &str, value: u32, expiry: Duration) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> CountingStore for Arc<S>
where
    S: CountingStore + ?Sized,
{
    async fn count(&self, key: &str) -> Result<u32, StoreError> {
        (**self).count(key).await
    }

    async fn update(&self, key: &str, value: u32, expiry: Duration) -> Result<(), StoreError> {
        (**self).update(key, value, expiry).await
    }
}

/// Bounds how many times `prefix:id` may be used before the next reset.
///
/// The read and the write are two store calls; concurrent `consume` calls for
/// the same id may both pass the check.
pub struct UsageCounter<S> {
    prefix: String,
    reset: ResetClock,
    max: u32,
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: CountingStore> UsageCounter<S> {
    pub fn new(prefix: impl Into<String>, reset: ResetClock, max: u32, store: S) -> Self {
        Self {
            prefix: prefix.into(),
            reset,
            max,
            store,
            clock: Arc::new(LocalClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Record one use of `id` and return the uses left before the reset.
    ///
    /// Fails with [`UsageError::QuotaExceeded`] without touching the store when
    /// the quota is already spent.
    pub async fn consume(&self, id: &str) -> Result<u32, UsageError> {
        let key = self.key(id);

        let used = self.store.count(&key).await?;
        if used >= self.max {
            return Err(UsageError::QuotaExceeded {
                used,
                max: self.max,
            });
        }

        let used = used + 1;
        let expiry = compute_reset_offset(self.clock.now(), self.reset);
        self.store.update(&key, used, expiry).await?;

        Ok(self.max - used)
    }

    /// Uses left for `id`, without recording one.
    pub async fn remaining(&self, id: &str) -> Result<u32, UsageError> {
        let used = self.store.count(&self.key(id)).await?;
        Ok(self.max.saturating_sub(used))
    }
}

impl<S> std::fmt::Debug for UsageCounter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageCounter")
            .field("prefix", &self.prefix)
            .field("reset", &self.reset)
            .field("max", &self.max)
            .finish()
    }
}
