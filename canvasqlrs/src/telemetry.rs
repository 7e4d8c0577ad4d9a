//! Logging setup.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "canvasql=info";

/// Install the fmt subscriber, filtered by `RUST_LOG` when set. Calling it
/// again, or after another subscriber was installed, is a no-op.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
