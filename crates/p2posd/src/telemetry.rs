//! Tracing subscriber initialization for the daemon.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber once at startup.
///
/// `RUST_LOG` overrides the default level.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
