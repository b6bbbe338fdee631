//! Document database bulk-insert client
//!
//! Streams an unbounded sequence of documents to a document database as a
//! single server-side operation. The request body is one JSON array written
//! while the application is still producing documents: encoding and
//! transmission overlap through a double-buffered pipeline, and a failed
//! write is reported with the server's own account of what went wrong.
//!
//! # Features
//!
//! - Lazy operation-id acquisition and stream establishment on first store
//! - Double-buffered encoding with at most one write in flight
//! - Optional gzip compression of the request body
//! - Server-side error recovery for failed writes and failed executions
//! - Dispose-once shutdown with ordered error aggregation
//! - Abort (server-side kill) of a running bulk insert
//! - YAML and environment configuration, `tracing` based logging
//!
//! # Example
//!
//! ```no_run
//! use docdb_bulk_insert::{BulkInsertClient, BulkInsertConfiguration, CompressionLevel};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), docdb_bulk_insert::BulkInsertError> {
//! let config = BulkInsertConfiguration::new(
//!     "http://localhost:8080".to_string(),
//!     "Northwind".to_string(),
//! )
//! .with_compression(CompressionLevel::Fastest);
//!
//! let client = BulkInsertClient::new(config)?;
//! let session = client.bulk_insert();
//! for i in 1..=3 {
//!     session
//!         .store_with_id(&json!({"Name": format!("user {}", i)}), &format!("users/{}", i), None)
//!         .await?;
//! }
//! session.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod bulk_insert;
pub mod client;
pub mod config;
pub mod conventions;
pub mod error;
pub mod observability;

pub use bulk_insert::{BulkInsertSession, BulkInsertStatistics, SessionState};
pub use client::{BulkInsertClient, RequestExecutor};
pub use config::{BulkInsertConfiguration, CompressionLevel, LogFormat, LoggingConfig};
pub use conventions::{Conventions, DocumentIdGenerator, EntityEncoder, Metadata};
pub use error::BulkInsertError;
