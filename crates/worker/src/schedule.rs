//! Recurring actions anchored to a daily reset clock.
//!
//! A schedule sleeps until the next occurrence of its reset clock, then fires
//! on every `frequency` tick after that. The first run is therefore one
//! `frequency` after the reset. Action failures are logged and the schedule
//! keeps ticking until the engine stops.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use incentive_core::{Clock, ResetClock, compute_reset_offset};

use crate::error::ScheduleError;
use crate::stats::EngineStats;

/// Passed to every run of a scheduled action.
#[derive(Debug, Clone)]
pub struct ScheduleContext {
    pub name: String,
    /// 1 for the first run.
    pub tick: u64,
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait ScheduledAction: Send + Sync {
    async fn run(&self, ctx: ScheduleContext) -> Result<(), ScheduleError>;
}

pub struct FnAction<F> {
    f: F,
}

/// Wrap an async closure as a scheduled action.
pub fn action_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(ScheduleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ScheduleError>> + Send + 'static,
{
    FnAction { f }
}

#[async_trait]
impl<F, Fut> ScheduledAction for FnAction<F>
where
    F: Fn(ScheduleContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ScheduleError>> + Send,
{
    async fn run(&self, ctx: ScheduleContext) -> Result<(), ScheduleError> {
        (self.f)(ctx).await
    }
}

#[derive(Clone)]
pub struct Schedule {
    name: String,
    reset: ResetClock,
    frequency: Duration,
    action: Arc<dyn ScheduledAction>,
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        reset: ResetClock,
        frequency: Duration,
        action: impl ScheduledAction + 'static,
    ) -> Result<Self, ScheduleError> {
        if frequency.is_zero() {
            return Err(ScheduleError::ZeroFrequency);
        }

        Ok(Self {
            name: name.into(),
            reset,
            frequency,
            action: Arc::new(action),
        })
    }

    /// Like [`Schedule::new`], parsing the reset clock from text (`3:00AM`).
    pub fn from_clock(
        name: impl Into<String>,
        clock: &str,
        frequency: Duration,
        action: impl ScheduledAction + 'static,
    ) -> Result<Self, ScheduleError> {
        let reset = ResetClock::parse(clock)?;
        Self::new(name, reset, frequency, action)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reset(&self) -> ResetClock {
        self.reset
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    /// Run until `shutdown` is cancelled.
    pub(crate) async fn run(
        self,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
        stats: Arc<EngineStats>,
    ) {
        let delay = compute_reset_offset(clock.now(), self.reset);
        info!(
            schedule = %self.name,
            reset = %self.reset,
            starts_in_secs = delay.as_secs(),
            "schedule armed"
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(schedule = %self.name, "schedule exited before first run");
                return;
            }
            _ = sleep(delay) => {}
        }

        let mut ticker = interval_at(Instant::now() + self.frequency, self.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut tick = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tick += 1;
            let ctx = ScheduleContext {
                name: self.name.clone(),
                tick,
                shutdown: shutdown.clone(),
            };

            match self.action.run(ctx).await {
                Ok(()) => {
                    debug!(schedule = %self.name, tick, "schedule run ok");
                    stats.record_schedule_run(true);
                }
                Err(e) => {
                    error!(schedule = %self.name, tick, error = %e, "schedule run failed");
                    stats.record_schedule_run(false);
                }
            }
        }

        info!(schedule = %self.name, runs = tick, "schedule exited");
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("name", &self.name)
            .field("reset", &self.reset)
            .field("frequency", &self.frequency)
            .finish()
    }
}
