//! Push-based observability for riskgate
//!
//! Structured logs go to stdout via `tracing`; metrics are rendered in the
//! Prometheus text format for a pushgateway. This module only SENDS data,
//! it never accepts requests.

pub mod metrics;

pub use metrics::Metrics;

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
