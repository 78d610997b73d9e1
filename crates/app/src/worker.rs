use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use incentive_infra::event_bus::{RedisStreamsConfig, RedisStreamsListener};
use incentive_infra::handlers::{TRIP_TOPIC, trip_completed};
use incentive_infra::rollover_action;
use incentive_infra::store::RedisLeaderboard;
use incentive_worker::{
    Engine, EngineConfig, EngineMode, LoggingMiddleware, Schedule, TracingMiddleware,
};

use crate::cli::{CommonArgs, WorkerArgs};
use crate::shutdown::shutdown_signal;

pub const ROLLOVER_SCHEDULE: &str = "leaderboard-rollover";

pub fn engine_config(args: &WorkerArgs) -> EngineConfig {
    EngineConfig::default()
        .with_queue_capacity(args.queue_size)
        .with_mode(args.mode)
}

pub fn streams_config(args: &WorkerArgs) -> RedisStreamsConfig {
    let config = RedisStreamsConfig::default().with_group(&args.consumer_group);
    match &args.consumer_name {
        Some(name) => config.with_consumer(name),
        None => config,
    }
}

/// Wire Redis, the trip handler and the rollover schedule, then serve until a signal.
pub async fn run(common: &CommonArgs, args: WorkerArgs) -> anyhow::Result<()> {
    let mode: EngineMode = args.mode;
    let board = Arc::new(
        RedisLeaderboard::connect(&common.redis_url)
            .await
            .context("connect leaderboard store")?,
    );

    let mut builder = Engine::builder(engine_config(&args))
        .with_middleware(TracingMiddleware)
        .with_middleware(LoggingMiddleware);

    if mode.runs_consumers() {
        let listener = RedisStreamsListener::new(&common.redis_url, streams_config(&args))
            .context("create redis streams listener")?;
        builder = builder
            .with_listener(Arc::new(listener))
            .route(TRIP_TOPIC, trip_completed(board.clone()));
    }

    if mode.runs_schedules() {
        let schedule = Schedule::from_clock(
            ROLLOVER_SCHEDULE,
            &args.leaderboard_reset_clock,
            Duration::from_secs(args.leaderboard_rollover_every),
            rollover_action(board),
        )
        .context("leaderboard rollover schedule")?;
        builder = builder.with_schedule(schedule);
    }

    let engine = builder.build().context("build engine")?;
    info!(mode = %mode, topics = ?engine.topics(), "worker starting");

    engine
        .serve(shutdown_signal())
        .await
        .context("worker engine")?;

    info!(stats = ?engine.stats(), "worker stopped");
    Ok(())
}
