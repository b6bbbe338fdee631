//! Configuration types for the bulk-insert client
//!
//! This module defines the configuration structures and validation logic.

use crate::error::BulkInsertError;
use serde::{Deserialize, Serialize};

/// Default threshold at which the active encoding buffer is handed to the network (1 MiB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default timeout of the streamed bulk-insert request (12 hours)
pub const DEFAULT_BULK_INSERT_TIMEOUT_SECS: u64 = 12 * 60 * 60;

/// Compression applied to the request body
///
/// Anything other than `NoCompression` gzips the body and advertises
/// `Content-Encoding: gzip`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Send the JSON array as-is
    #[default]
    NoCompression,
    /// Fastest gzip level
    Fastest,
    /// Balanced gzip level
    Optimal,
    /// Best gzip ratio
    SmallestSize,
}

impl CompressionLevel {
    /// Whether the body is gzip-encoded
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressionLevel::NoCompression)
    }

    /// Map to a `flate2` level, `None` when compression is disabled
    pub fn to_flate2(&self) -> Option<flate2::Compression> {
        match self {
            CompressionLevel::NoCompression => None,
            CompressionLevel::Fastest => Some(flate2::Compression::fast()),
            CompressionLevel::Optimal => Some(flate2::Compression::default()),
            CompressionLevel::SmallestSize => Some(flate2::Compression::best()),
        }
    }
}

impl std::str::FromStr for CompressionLevel {
    type Err = BulkInsertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "no_compression" | "none" => Ok(CompressionLevel::NoCompression),
            "fastest" => Ok(CompressionLevel::Fastest),
            "optimal" => Ok(CompressionLevel::Optimal),
            "smallest_size" => Ok(CompressionLevel::SmallestSize),
            other => Err(BulkInsertError::ConfigurationError(format!(
                "unknown compression level: '{}'",
                other
            ))),
        }
    }
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter for tracing (e.g., "info", "debug", "warn", "error")
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (default: text)
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Validate the logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `log_level` is not a valid log level.
    pub fn validate(&self) -> Result<(), BulkInsertError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(BulkInsertError::ConfigurationError(format!(
                "log_level must be one of {:?}, got: '{}'",
                valid_levels, self.log_level
            )));
        }
        Ok(())
    }
}

/// Complete configuration for a bulk-insert client
///
/// Represents everything needed to talk to one database: server location,
/// body compression, buffering, timeouts, retry policy and logging.
#[derive(Debug, Clone)]
pub struct BulkInsertConfiguration {
    /// Server URL (required)
    pub server_url: String,
    /// Target database name (required)
    pub database: String,
    /// Request body compression (default: none)
    pub compression: CompressionLevel,
    /// Size in bytes after which the active buffer is swapped out (default: 1 MiB)
    pub max_buffer_size: usize,
    /// Timeout of the streamed bulk-insert request in seconds (default: 12 hours)
    pub bulk_insert_timeout_secs: u64,
    /// Timeout of short control requests (id, status, kill) in seconds (default: 30)
    pub request_timeout_secs: u64,
    /// Maximum retry attempts for transient failures of control requests (default: 5)
    pub retry_max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff (default: 100)
    pub retry_base_delay_ms: u64,
    /// Maximum delay in milliseconds for exponential backoff (default: 30000)
    pub retry_max_delay_ms: u64,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl BulkInsertConfiguration {
    /// Create a new configuration with defaults
    ///
    /// # Arguments
    ///
    /// * `server_url` - Server URL
    /// * `database` - Target database name
    ///
    /// # Example
    ///
    /// ```no_run
    /// use docdb_bulk_insert::BulkInsertConfiguration;
    ///
    /// let config = BulkInsertConfiguration::new(
    ///     "http://localhost:8080".to_string(),
    ///     "northwind".to_string(),
    /// );
    /// ```
    pub fn new(server_url: String, database: String) -> Self {
        Self {
            server_url,
            database,
            compression: CompressionLevel::NoCompression,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            bulk_insert_timeout_secs: DEFAULT_BULK_INSERT_TIMEOUT_SECS,
            request_timeout_secs: 30,
            retry_max_attempts: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 30000,
            logging: LoggingConfig::default(),
        }
    }

    /// Set request body compression
    pub fn with_compression(mut self, compression: CompressionLevel) -> Self {
        self.compression = compression;
        self
    }

    /// Set the buffer swap threshold
    ///
    /// # Arguments
    ///
    /// * `max_buffer_size` - Size in bytes after which the active buffer is transmitted
    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Set timeouts
    ///
    /// # Arguments
    ///
    /// * `bulk_insert_timeout_secs` - Timeout of the streamed request
    /// * `request_timeout_secs` - Timeout of control requests
    pub fn with_timeouts(mut self, bulk_insert_timeout_secs: u64, request_timeout_secs: u64) -> Self {
        self.bulk_insert_timeout_secs = bulk_insert_timeout_secs;
        self.request_timeout_secs = request_timeout_secs;
        self
    }

    /// Set retry configuration
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum retry attempts
    /// * `base_delay_ms` - Base delay in milliseconds for exponential backoff
    /// * `max_delay_ms` - Maximum delay in milliseconds
    pub fn with_retry_config(
        mut self,
        max_attempts: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
    ) -> Self {
        self.retry_max_attempts = max_attempts;
        self.retry_base_delay_ms = base_delay_ms;
        self.retry_max_delay_ms = max_delay_ms;
        self
    }

    /// Set logging configuration
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Validate configuration
    ///
    /// Checks that all required fields are present and valid.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if:
    /// - `server_url` is not a valid URL starting with `https://` or `http://`
    /// - `database` is empty
    /// - `max_buffer_size` is 0
    /// - either timeout is 0
    /// - `retry_max_attempts` is 0 or the retry delays are inverted
    /// - the logging configuration is invalid
    pub fn validate(&self) -> Result<(), BulkInsertError> {
        if !self.server_url.starts_with("https://") && !self.server_url.starts_with("http://") {
            return Err(BulkInsertError::ConfigurationError(format!(
                "server_url must start with 'https://' or 'http://', got: '{}'",
                self.server_url
            )));
        }
        url::Url::parse(&self.server_url).map_err(|e| {
            BulkInsertError::ConfigurationError(format!(
                "server_url is not a valid URL '{}': {}",
                self.server_url, e
            ))
        })?;

        if self.database.trim().is_empty() {
            return Err(BulkInsertError::ConfigurationError(
                "database cannot be empty".to_string(),
            ));
        }

        if self.max_buffer_size == 0 {
            return Err(BulkInsertError::ConfigurationError(
                "max_buffer_size must be > 0".to_string(),
            ));
        }

        if self.bulk_insert_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(BulkInsertError::ConfigurationError(
                "timeouts must be > 0".to_string(),
            ));
        }

        if self.retry_max_attempts == 0 {
            return Err(BulkInsertError::ConfigurationError(
                "retry_max_attempts must be > 0".to_string(),
            ));
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(BulkInsertError::ConfigurationError(format!(
                "retry_max_delay_ms ({}) must be >= retry_base_delay_ms ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }

        self.logging.validate()
    }
}
