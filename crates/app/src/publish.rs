use anyhow::Context;
use tracing::info;

use incentive_infra::event_bus::RedisStreamsProducer;
use incentive_worker::Producer;

use crate::cli::{CommonArgs, PublishArgs};

pub async fn run(common: &CommonArgs, args: PublishArgs) -> anyhow::Result<()> {
    let producer = RedisStreamsProducer::connect(&common.redis_url, args.default_topic.clone())
        .await
        .context("connect producer")?;

    producer
        .produce(args.key.as_bytes(), args.value.as_bytes(), args.topic.as_deref())
        .await
        .context("publish message")?;

    info!(
        topic = ?args.topic.as_deref().or(args.default_topic.as_deref()),
        bytes = args.value.len(),
        "message published"
    );
    Ok(())
}
