//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building core values from configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A reset clock could not be parsed or is out of range.
    #[error("invalid reset clock: {0}")]
    InvalidResetClock(String),
}

impl CoreError {
    pub fn invalid_reset_clock(msg: impl Into<String>) -> Self {
        Self::InvalidResetClock(msg.into())
    }
}
