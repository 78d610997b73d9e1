//! Leaderboards as Redis sorted sets, one per service zone.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info};

use crate::handlers::trip::TripEvent;
use crate::leaderboard::{
    BOARD_PREFIX, Leaderboard, LeaderboardError, Standing, board_key, ensure_rankable,
    previous_board_key,
};

const SCAN_COUNT: usize = 100;

#[derive(Clone)]
pub struct RedisLeaderboard {
    conn: MultiplexedConnection,
}

fn unavailable(op: &str) -> impl FnOnce(redis::RedisError) -> LeaderboardError + '_ {
    move |e| LeaderboardError::Unavailable(format!("{op}: {e}"))
}

impl RedisLeaderboard {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LeaderboardError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable("open"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable("connect"))?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    async fn current_boards(&self) -> Result<Vec<String>, LeaderboardError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{BOARD_PREFIX}:*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(unavailable("SCAN"))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl Leaderboard for RedisLeaderboard {
    async fn record_trip(&self, trip: &TripEvent) -> Result<(), LeaderboardError> {
        ensure_rankable(trip)?;

        let mut conn = self.conn.clone();
        let key = board_key(&trip.service_zone);
        let score: f64 = conn
            .zincr(&key, &trip.driver_id, 1)
            .await
            .map_err(unavailable("ZINCRBY"))?;

        debug!(
            board = %key,
            driver_id = %trip.driver_id,
            trip_request_id = %trip.trip_request_id,
            score,
            "leaderboard updated"
        );
        Ok(())
    }

    async fn rollover(&self) -> Result<usize, LeaderboardError> {
        let boards = self.current_boards().await?;
        let mut conn = self.conn.clone();

        for key in &boards {
            let zone = key
                .strip_prefix(BOARD_PREFIX)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(key);
            let _: () = conn
                .rename(key, previous_board_key(zone))
                .await
                .map_err(unavailable("RENAME"))?;
        }

        info!(boards = boards.len(), "leaderboards moved to previous period");
        Ok(boards.len())
    }

    async fn top(&self, zone: &str, limit: usize) -> Result<Vec<Standing>, LeaderboardError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(board_key(zone))
            .arg(0)
            .arg(limit - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(unavailable("ZREVRANGE"))?;

        Ok(rows
            .into_iter()
            .map(|(driver_id, trips)| Standing { driver_id, trips })
            .collect())
    }
}

impl std::fmt::Debug for RedisLeaderboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RedisLeaderboard")
    }
}
