//! Command line and environment configuration. Flags win over env vars.

use clap::{Args, Parser, Subcommand};

use incentive_observability::{LogFormat, LoggingConfig};
use incentive_worker::{DEFAULT_QUEUE_CAPACITY, EngineMode};

#[derive(Parser, Debug)]
#[command(name = "incentive")]
#[command(version)]
#[command(about = "Driver incentive job worker")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.common.log_level.clone(),
            format: self.common.log_format,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    pub redis_url: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOGGING_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format (json or pretty)
    #[arg(long, env = "LOGGING_FORMAT", default_value = "json", global = true)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the job engine until SIGINT/SIGTERM
    Worker(WorkerArgs),

    /// Publish one message to a stream
    Publish(PublishArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Which parts of the engine run (all, consumers, schedulers)
    #[arg(long, env = "WORKER_MODE", default_value = "all")]
    pub mode: EngineMode,

    /// Job queue capacity; 0 uses the default
    #[arg(long, env = "WORKER_QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_size: usize,

    /// Consumer group shared by every worker process
    #[arg(long, env = "CONSUMER_GROUP", default_value = "incentive-worker")]
    pub consumer_group: String,

    /// Consumer name inside the group; generated when unset
    #[arg(long, env = "CONSUMER_NAME")]
    pub consumer_name: Option<String>,

    /// Local clock time of the leaderboard rollover (3:00AM or 03:00)
    #[arg(long, env = "LEADERBOARD_RESET_CLOCK", default_value = "3:00AM")]
    pub leaderboard_reset_clock: String,

    /// Seconds between leaderboard rollovers
    #[arg(long, env = "LEADERBOARD_ROLLOVER_EVERY", default_value_t = 86_400)]
    pub leaderboard_rollover_every: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    /// Target stream; falls back to PRODUCER_DEFAULT_TOPIC
    #[arg(long)]
    pub topic: Option<String>,

    /// Default stream when --topic is not given
    #[arg(long, env = "PRODUCER_DEFAULT_TOPIC")]
    pub default_topic: Option<String>,

    /// Message key
    #[arg(long, default_value = "")]
    pub key: String,

    /// Message body
    pub value: String,
}
