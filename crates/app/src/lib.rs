//! The `incentive` binary: configuration, wiring and process lifecycle.

pub mod cli;
pub mod publish;
pub mod shutdown;
pub mod worker;
