//! `incentive-core` — time primitives shared by the worker engine.
//!
//! This crate is **pure** (no IO, no async): daily reset clocks, the reset
//! offset computation, and a wall-clock abstraction that tests can pin.

pub mod clock;
pub mod error;
pub mod reset;

pub use clock::{Clock, FixedClock, LocalClock};
pub use error::{CoreError, CoreResult};
pub use reset::{compute_reset_offset, ResetClock, FULL_DAY};
