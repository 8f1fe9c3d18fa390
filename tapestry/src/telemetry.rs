//! Tracing subscriber setup

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over the configured filter. Returns false if a subscriber
/// was already installed, which is expected when several tests or embedders
/// call this.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let level = if config.verbose {
        "debug"
    } else {
        config.filter.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
