//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
//! the configured level; the format is `text` or `json`.

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Initialize the global subscriber from the logging configuration
///
/// A subscriber installed earlier (tests, embedding applications) is kept.
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<()> {
    let filter = env_filter(&config.level)?;

    let installed = match config.format.as_str() {
        "json" => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        _ => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if installed.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %config.level, format = %config.format, "Structured logging initialized");
    Ok(())
}

/// `RUST_LOG` when set, else the configured directive
fn env_filter(level: &str) -> GatewayResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            GatewayError::config(format!("invalid log level '{}': {}", level, e))
        }),
    }
}
