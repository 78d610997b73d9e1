//! Redis-backed stores.

#[cfg(feature = "redis")]
pub mod redis_counter;
#[cfg(feature = "redis")]
pub mod redis_leaderboard;

#[cfg(feature = "redis")]
pub use redis_counter::RedisCountingStore;
#[cfg(feature = "redis")]
pub use redis_leaderboard::RedisLeaderboard;
