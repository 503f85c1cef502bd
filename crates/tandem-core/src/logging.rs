//! Tracing setup for embedders and tests.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `tandem_core=info`. Safe to call more
/// than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tandem_core=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
