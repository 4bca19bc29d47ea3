//! Subscriber setup for binaries and tests embedding the core.

use tracing_subscriber::EnvFilter;

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG` (default
/// `info`). Returns false if a global subscriber was already set.
pub fn init() -> bool {
    init_with_default("info")
}

pub fn init_with_default(directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}
