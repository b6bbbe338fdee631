//! Configuration loader for the bulk-insert client
//!
//! This module handles loading configuration from YAML files and environment variables.

use crate::config::{BulkInsertConfiguration, CompressionLevel, LogFormat, LoggingConfig};
use crate::error::BulkInsertError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// YAML configuration structure (for deserialization)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigYaml {
    pub server_url: Option<String>,
    pub database: Option<String>,
    pub compression: Option<CompressionLevel>,
    pub max_buffer_size: Option<usize>,
    pub timeouts: Option<TimeoutsYaml>,
    pub retry: Option<RetryYaml>,
    pub logging: Option<LoggingYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsYaml {
    pub bulk_insert_secs: Option<u64>,
    pub request_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryYaml {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingYaml {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

/// Load configuration from YAML file
///
/// # Arguments
///
/// * `path` - Path to YAML configuration file
///
/// # Returns
///
/// Returns `BulkInsertConfiguration` if successful, or `BulkInsertError` if loading fails.
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<BulkInsertConfiguration, BulkInsertError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        BulkInsertError::ConfigurationError(format!(
            "Failed to read config file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    let yaml: ConfigYaml = serde_yaml::from_str(&content)
        .map_err(|e| BulkInsertError::ConfigurationError(format!("Failed to parse YAML: {}", e)))?;

    let mut config = BulkInsertConfiguration::new(
        yaml.server_url.ok_or_else(|| {
            BulkInsertError::ConfigurationError("server_url is required".to_string())
        })?,
        yaml.database
            .ok_or_else(|| BulkInsertError::ConfigurationError("database is required".to_string()))?,
    );

    if let Some(compression) = yaml.compression {
        config = config.with_compression(compression);
    }

    if let Some(max_buffer_size) = yaml.max_buffer_size {
        config = config.with_max_buffer_size(max_buffer_size);
    }

    if let Some(timeouts) = yaml.timeouts {
        if let Some(secs) = timeouts.bulk_insert_secs {
            config.bulk_insert_timeout_secs = secs;
        }
        if let Some(secs) = timeouts.request_secs {
            config.request_timeout_secs = secs;
        }
    }

    if let Some(retry) = yaml.retry {
        if let (Some(max), Some(base), Some(max_delay)) =
            (retry.max_attempts, retry.base_delay_ms, retry.max_delay_ms)
        {
            config = config.with_retry_config(max, base, max_delay);
        }
    }

    if let Some(logging) = yaml.logging {
        config = config.with_logging(LoggingConfig {
            log_level: logging.level.unwrap_or_else(|| "info".to_string()),
            format: logging.format.unwrap_or_default(),
        });
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// Reads configuration from environment variables with the following prefixes:
/// - `BULK_INSERT_` for connection, compression, buffering and timeout settings
/// - `RETRY_` for retry settings
/// - `LOG_` for logging settings
///
/// # Returns
///
/// Returns `BulkInsertConfiguration` if successful, or `BulkInsertError` if loading fails.
pub fn load_from_env() -> Result<BulkInsertConfiguration, BulkInsertError> {
    let server_url = std::env::var("BULK_INSERT_SERVER_URL").map_err(|_| {
        BulkInsertError::ConfigurationError(
            "BULK_INSERT_SERVER_URL environment variable is required".to_string(),
        )
    })?;

    let database = std::env::var("BULK_INSERT_DATABASE").map_err(|_| {
        BulkInsertError::ConfigurationError(
            "BULK_INSERT_DATABASE environment variable is required".to_string(),
        )
    })?;

    let mut config = BulkInsertConfiguration::new(server_url, database);

    if let Ok(compression) = std::env::var("BULK_INSERT_COMPRESSION") {
        config = config.with_compression(compression.parse()?);
    }

    if let Ok(size) = std::env::var("BULK_INSERT_MAX_BUFFER_SIZE") {
        let size = size.parse::<usize>().map_err(|e| {
            BulkInsertError::ConfigurationError(format!(
                "BULK_INSERT_MAX_BUFFER_SIZE must be an integer: {}",
                e
            ))
        })?;
        config = config.with_max_buffer_size(size);
    }

    if let Ok(secs) = std::env::var("BULK_INSERT_TIMEOUT_SECS") {
        config.bulk_insert_timeout_secs =
            secs.parse().unwrap_or(config.bulk_insert_timeout_secs);
    }

    if let (Ok(max), Ok(base), Ok(max_delay)) = (
        std::env::var("RETRY_MAX_ATTEMPTS"),
        std::env::var("RETRY_BASE_DELAY_MS"),
        std::env::var("RETRY_MAX_DELAY_MS"),
    ) {
        if let (Ok(max_u32), Ok(base_u64), Ok(max_delay_u64)) = (
            max.parse::<u32>(),
            base.parse::<u64>(),
            max_delay.parse::<u64>(),
        ) {
            config = config.with_retry_config(max_u32, base_u64, max_delay_u64);
        }
    }

    if let Ok(level) = std::env::var("LOG_LEVEL") {
        config.logging.log_level = level;
    }
    if std::env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        config.logging.format = LogFormat::Json;
    }

    config.validate()?;
    Ok(config)
}
