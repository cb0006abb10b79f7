//! Console logging setup.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Initializes the fmt subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn setup_tracing(log_level: LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("rebalancer_bridge={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
