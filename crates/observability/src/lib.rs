//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability with JSON logs.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    init_with(LogFormat::Json);
}

/// Initialize process-wide observability with an explicit log format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
    metrics::describe_metrics();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Metric names and descriptions for the `metrics` facade.
pub mod metrics;

pub use self::tracing::LogFormat;
