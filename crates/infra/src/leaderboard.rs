//! Driver leaderboards per service zone.
//!
//! Each zone has a current board (`driver_leaderboard:{zone}`) scored by
//! completed trips. A rollover moves every current board to
//! `previous_driver_leaderboard:{zone}` and starts the new period empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use incentive_worker::{ScheduleError, ScheduledAction, action_fn};

use crate::handlers::trip::TripEvent;

pub const BOARD_PREFIX: &str = "driver_leaderboard";
pub const PREVIOUS_BOARD_PREFIX: &str = "previous_driver_leaderboard";

pub fn board_key(zone: &str) -> String {
    format!("{BOARD_PREFIX}:{zone}")
}

pub fn previous_board_key(zone: &str) -> String {
    format!("{PREVIOUS_BOARD_PREFIX}:{zone}")
}

#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("trip {trip_request_id} cannot be ranked: {reason}")]
    InvalidTrip {
        trip_request_id: String,
        reason: &'static str,
    },

    #[error("leaderboard store unavailable: {0}")]
    Unavailable(String),
}

/// One row of a board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standing {
    pub driver_id: String,
    pub trips: f64,
}

#[async_trait]
pub trait Leaderboard: Send + Sync {
    /// Credit the trip's driver on its zone's current board.
    async fn record_trip(&self, trip: &TripEvent) -> Result<(), LeaderboardError>;

    /// Move every current board to its previous slot. Returns the number of boards moved.
    async fn rollover(&self) -> Result<usize, LeaderboardError>;

    /// Best `limit` drivers of the current board, highest first.
    async fn top(&self, zone: &str, limit: usize) -> Result<Vec<Standing>, LeaderboardError>;
}

#[async_trait]
impl<L> Leaderboard for Arc<L>
where
    L: Leaderboard + ?Sized,
{
    async fn record_trip(&self, trip: &TripEvent) -> Result<(), LeaderboardError> {
        (**self).record_trip(trip).await
    }

    async fn rollover(&self) -> Result<usize, LeaderboardError> {
        (**self).rollover().await
    }

    async fn top(&self, zone: &str, limit: usize) -> Result<Vec<Standing>, LeaderboardError> {
        (**self).top(zone, limit).await
    }
}

/// Reject trips that cannot be placed on a board.
pub(crate) fn ensure_rankable(trip: &TripEvent) -> Result<(), LeaderboardError> {
    let reason = if trip.driver_id.trim().is_empty() {
        "missing driver_id"
    } else if trip.service_zone.trim().is_empty() {
        "missing service_zone"
    } else {
        return Ok(());
    };

    Err(LeaderboardError::InvalidTrip {
        trip_request_id: trip.trip_request_id.clone(),
        reason,
    })
}

/// Scheduled action rolling every board over.
pub fn rollover_action<L>(board: Arc<L>) -> impl ScheduledAction
where
    L: Leaderboard + ?Sized + 'static,
{
    action_fn(move |ctx| {
        let board = board.clone();
        async move {
            let moved = board
                .rollover()
                .await
                .map_err(|e| ScheduleError::failed(e.to_string()))?;
            info!(schedule = %ctx.name, tick = ctx.tick, boards = moved, "leaderboards rolled over");
            Ok(())
        }
    })
}

type Boards = HashMap<String, HashMap<String, f64>>;

/// Process-local leaderboard (tests and local runs).
#[derive(Debug, Default)]
pub struct InMemoryLeaderboard {
    boards: Mutex<(Boards, Boards)>,
}

impl InMemoryLeaderboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standings of the previous period for `zone`, highest first.
    pub fn previous(&self, zone: &str) -> Vec<Standing> {
        let boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        ranked(boards.1.get(zone), usize::MAX)
    }
}

fn ranked(board: Option<&HashMap<String, f64>>, limit: usize) -> Vec<Standing> {
    let mut rows: Vec<Standing> = board
        .into_iter()
        .flatten()
        .map(|(driver_id, trips)| Standing {
            driver_id: driver_id.clone(),
            trips: *trips,
        })
        .collect();

    rows.sort_by(|a, b| {
        b.trips
            .total_cmp(&a.trips)
            .then_with(|| a.driver_id.cmp(&b.driver_id))
    });
    rows.truncate(limit);
    rows
}

#[async_trait]
impl Leaderboard for InMemoryLeaderboard {
    async fn record_trip(&self, trip: &TripEvent) -> Result<(), LeaderboardError> {
        ensure_rankable(trip)?;

        let mut boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        *boards
            .0
            .entry(trip.service_zone.clone())
            .or_default()
            .entry(trip.driver_id.clone())
            .or_default() += 1.0;
        Ok(())
    }

    async fn rollover(&self) -> Result<usize, LeaderboardError> {
        let mut boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        let current = std::mem::take(&mut boards.0);
        let moved = current.len();
        for (zone, board) in current {
            boards.1.insert(zone, board);
        }
        Ok(moved)
    }

    async fn top(&self, zone: &str, limit: usize) -> Result<Vec<Standing>, LeaderboardError> {
        let boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        Ok(ranked(boards.0.get(zone), limit))
    }
}
