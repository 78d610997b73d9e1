//! Tracing/logging setup shared by every binary.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogFormat, LoggingConfig, UnknownLogFormat};

/// Initialize process-wide logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LoggingConfig) {
    tracing::init(config);
}
