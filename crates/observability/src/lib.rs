//! Tracing/logging setup shared by every qcflow process.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError};

/// Initialize process-wide tracing.
///
/// Output format comes from `QCFLOW_LOG_FORMAT` (JSON when unset). Safe to
/// call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}

/// Like [`init`] with an explicit output format (CLIs usually want `Pretty`).
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}
