//! # Observability Infrastructure
//!
//! Structured logging for the control plane.

pub mod logging;

pub use logging::log_config_info;

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false`
/// when a subscriber was already installed (for example by a test harness).
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let installed = if config.json_logging {
        fmt().with_env_filter(filter).json().with_current_span(true).try_init().is_ok()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init().is_ok()
    };

    if installed {
        tracing::info!(
            service_name = %config.service_name,
            log_level = %config.log_level,
            json = config.json_logging,
            "Logging initialized"
        );
    }
    installed
}
