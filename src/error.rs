//! Error types for the bulk-insert client
//!
//! This module defines all error types used throughout the crate,
//! providing clear, actionable error messages for developers.

use thiserror::Error;

/// Error type for bulk-insert operations
///
/// All errors are descriptive and actionable, providing sufficient
/// information for developers to diagnose and resolve issues.
#[derive(Debug, Clone, Error)]
pub enum BulkInsertError {
    /// Invalid configuration error
    ///
    /// Occurs when configuration values are invalid or missing required fields.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Invalid document identifier
    ///
    /// Occurs when a document id is empty or ends with the reserved `|`
    /// separator. Raised before any network activity.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Overlapping store calls on the same session
    ///
    /// Concurrent stores are rejected, not queued. The session state is unchanged.
    #[error("Concurrency violation: {0}")]
    ConcurrencyViolation(String),

    /// The request body handshake could not be completed
    ///
    /// Fatal for the session.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Network/connection error
    ///
    /// Occurs when the server cannot be reached or the connection drops.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The server answered with a non-success status
    #[error("Server error (status {status}): {message}")]
    ServerError {
        /// HTTP status code returned by the server
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// The server does not know the requested operation
    #[error("Operation {0} was not found on the server")]
    OperationNotFound(i64),

    /// The server reported a terminal error for the operation
    ///
    /// This is the authoritative cause of a failed bulk insert whenever it
    /// can be retrieved.
    #[error("Operation failed on the server: {0}")]
    OperationFailed(String),

    /// Local failure while writing to the request body stream
    #[error("Transmission error: {0}")]
    TransmissionError(String),

    /// Entity or metadata could not be encoded as JSON
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The session's cancellation token fired
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// All retry attempts exhausted
    ///
    /// Occurs when all retry attempts for transient failures have been exhausted.
    #[error("Retry exhausted: {0}")]
    RetryExhausted(String),

    /// The bulk insert was aborted
    ///
    /// `causes` is ordered most-diagnostic first: the server's authoritative
    /// error (if any), then the local error, then any flush error.
    #[error("Bulk insert aborted: {message}{}", render_causes(.causes))]
    Aborted {
        /// Summary of what failed
        message: String,
        /// Underlying errors in priority order
        causes: Vec<BulkInsertError>,
    },
}

fn render_causes(causes: &[BulkInsertError]) -> String {
    if causes.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = causes.iter().map(|c| c.to_string()).collect();
    format!(" (caused by: {})", rendered.join("; "))
}

impl BulkInsertError {
    /// Build an `Aborted` error without underlying causes
    pub fn aborted(message: impl Into<String>) -> Self {
        BulkInsertError::Aborted {
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Build an `Aborted` error wrapping the given causes in priority order
    pub fn aborted_with(message: impl Into<String>, causes: Vec<BulkInsertError>) -> Self {
        BulkInsertError::Aborted {
            message: message.into(),
            causes,
        }
    }

    /// Check if the error is retryable
    ///
    /// Returns true for transient errors that should be retried:
    /// - ConnectionError
    /// - ServerError with a 5xx status
    pub fn is_retryable(&self) -> bool {
        match self {
            BulkInsertError::ConnectionError(_) => true,
            BulkInsertError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Underlying causes of an `Aborted` error, empty for every other variant
    pub fn causes(&self) -> &[BulkInsertError] {
        match self {
            BulkInsertError::Aborted { causes, .. } => causes,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for BulkInsertError {
    fn from(e: serde_json::Error) -> Self {
        BulkInsertError::SerializationError(e.to_string())
    }
}

impl From<std::io::Error> for BulkInsertError {
    fn from(e: std::io::Error) -> Self {
        BulkInsertError::TransmissionError(e.to_string())
    }
}
