//! Infrastructure layer: Redis transport and stores, job handlers.

pub mod event_bus;
pub mod handlers;
pub mod leaderboard;
pub mod store;

pub use leaderboard::{InMemoryLeaderboard, Leaderboard, LeaderboardError, Standing, rollover_action};
