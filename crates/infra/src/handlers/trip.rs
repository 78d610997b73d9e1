//! `trips` topic: completed trips feed the driver leaderboards.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use incentive_worker::{HandlerError, Job, JobContext, JobHandler};

use crate::leaderboard::Leaderboard;

pub const TRIP_TOPIC: &str = "trips";

const STATUS_COMPLETE: &str = "complete";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripPrice {
    pub total: i64,
    #[serde(rename = "final")]
    pub final_price: i64,
    pub currency: String,
    pub driver_earnings: f64,
    pub distance: i64,
    pub duration: i64,
}

/// Trip lifecycle event as published on the `trips` topic.
///
/// Unknown fields are ignored; missing ones take their default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripEvent {
    pub trip_request_id: String,
    pub customer_id: String,
    pub driver_id: String,
    pub service_id: String,
    pub service_zone: String,
    pub status: String,
    pub price: TripPrice,
    pub idempotency_key: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TripEvent {
    pub fn is_complete(&self) -> bool {
        self.status == STATUS_COMPLETE
    }
}

/// Handler for completed trips.
pub struct TripCompleted<L> {
    board: L,
}

pub fn trip_completed<L>(board: L) -> TripCompleted<L>
where
    L: Leaderboard + 'static,
{
    TripCompleted { board }
}

#[async_trait]
impl<L> JobHandler for TripCompleted<L>
where
    L: Leaderboard,
{
    async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
        let trip: TripEvent = job.decode()?;

        if !trip.is_complete() {
            debug!(
                worker_id = ctx.worker_id(),
                trip_request_id = %trip.trip_request_id,
                status = %trip.status,
                "trip not complete; leaderboard untouched"
            );
            return Ok(());
        }

        self.board
            .record_trip(&trip)
            .await
            .context("update leaderboard")?;
        Ok(())
    }
}
