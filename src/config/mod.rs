//! Configuration module for the bulk-insert client
//!
//! This module handles configuration loading, validation, and management.

pub mod loader;
pub mod types;

pub use types::{BulkInsertConfiguration, CompressionLevel, LogFormat, LoggingConfig};
