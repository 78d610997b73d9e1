use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    unrouted: AtomicU64,
    ack_failed: AtomicU64,
    schedule_runs: AtomicU64,
    schedule_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unrouted: u64,
    pub ack_failed: u64,
    pub schedule_runs: u64,
    pub schedule_failures: u64,
}

impl EngineStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unrouted(&self) {
        self.unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_failed(&self) {
        self.ack_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_schedule_run(&self, ok: bool) {
        self.schedule_runs.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.schedule_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            ack_failed: self.ack_failed.load(Ordering::Relaxed),
            schedule_runs: self.schedule_runs.load(Ordering::Relaxed),
            schedule_failures: self.schedule_failures.load(Ordering::Relaxed),
        }
    }
}
