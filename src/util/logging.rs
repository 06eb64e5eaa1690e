//! Logging initialization and health-change reporting.

use crate::balancer::StateChange;
use crate::config::LogFormat;
use crate::health::Health;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Arguments
///
/// * `level` - Log level filter (e.g., "info", "debug")
/// * `format` - Log output format (json or pretty)
pub fn init_logging(level: &str, format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry.with(fmt::layer().json()).init();
        }
        LogFormat::Pretty => {
            registry.with(fmt::layer().pretty()).init();
        }
    }
}

/// Breaker observer that reports every backend transition.
///
/// Registered by the binary on each backend it adds, next to the pool's own
/// failover observer.
pub fn log_state_change(change: &StateChange) {
    match (change.health, &change.error) {
        (Health::Down, Some(error)) => warn!(
            protocol = %change.protocol,
            server = %change.server,
            error = %error,
            "backend down"
        ),
        (Health::Down, None) => warn!(
            protocol = %change.protocol,
            server = %change.server,
            "backend down"
        ),
        (Health::Up, _) => info!(
            protocol = %change.protocol,
            server = %change.server,
            "backend up"
        ),
    }
}
