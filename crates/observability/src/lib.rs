//! Tracing setup and the log-backed monitor sink.

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Engine events rendered as log lines.
pub mod monitor;

pub use monitor::TracingMonitor;
pub use self::tracing::{LogFormat, init_with};
