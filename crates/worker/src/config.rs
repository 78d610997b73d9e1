//! Engine configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Queue capacity and worker count used when none (or zero) is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Which halves of the engine run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Consumers and schedules.
    #[default]
    All,
    /// Only the listener and worker pool.
    ConsumersOnly,
    /// Only recurring schedules.
    SchedulersOnly,
}

impl EngineMode {
    pub fn runs_consumers(self) -> bool {
        matches!(self, Self::All | Self::ConsumersOnly)
    }

    pub fn runs_schedules(self) -> bool {
        matches!(self, Self::All | Self::SchedulersOnly)
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::ConsumersOnly => "consumers",
            Self::SchedulersOnly => "schedulers",
        })
    }
}

impl FromStr for EngineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "consumers" | "consumer" | "consumers_only" => Ok(Self::ConsumersOnly),
            "schedulers" | "scheduler" | "schedulers_only" => Ok(Self::SchedulersOnly),
            other => Err(format!(
                "unknown engine mode '{other}' (expected all, consumers or schedulers)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded queue capacity; also the number of workers. Zero means default.
    pub queue_capacity: usize,
    pub mode: EngineMode,
    /// How long `stop` waits for in-flight jobs before aborting workers.
    /// `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            mode: EngineMode::All,
            drain_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl EngineConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Effective queue capacity (and worker count).
    pub fn capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            self.queue_capacity
        }
    }
}
