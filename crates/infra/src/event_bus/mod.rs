//! Stream transports for the worker engine.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConfig, RedisStreamsListener, RedisStreamsProducer};
