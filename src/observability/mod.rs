//! Logging bootstrap and the metrics contract.

pub mod metrics;

pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG`; falls back to `default_directive` (e.g. `"info"`).
/// Safe to call more than once: later calls are ignored.
pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
