//! Opt-in tracing bootstrap for binaries and tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber honoring `RUST_LOG`, once.
///
/// Library code never calls this; embedders and tests opt in.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}
