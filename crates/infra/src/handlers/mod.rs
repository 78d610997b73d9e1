//! Job handlers registered by the worker binary.

pub mod trip;

pub use trip::{TRIP_TOPIC, TripCompleted, TripEvent, trip_completed};
