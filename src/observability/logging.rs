//! Tracing subscriber setup
//!
//! The crate itself only emits `tracing` events. Applications that do not
//! install their own subscriber can call [`init_tracing`] once at startup.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::BulkInsertError;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber for the given logging configuration
///
/// `RUST_LOG` takes precedence over `config.log_level` when set.
///
/// # Errors
///
/// Returns `ConfigurationError` if the level is invalid or a global
/// subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), BulkInsertError> {
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.to_lowercase()))
        .map_err(|e| {
            BulkInsertError::ConfigurationError(format!("Invalid log filter: {}", e))
        })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| {
        BulkInsertError::ConfigurationError(format!("Failed to install tracing subscriber: {}", e))
    })
}
