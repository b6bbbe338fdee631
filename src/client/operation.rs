//! Server operation state as returned by the status endpoint

use crate::error::BulkInsertError;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a server-side operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    InProgress,
    Completed,
    Faulted,
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }
}

/// Result payload attached to an operation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum OperationResult {
    /// The operation failed; `error` carries the server-side details
    #[serde(rename = "OperationExceptionResult", rename_all = "PascalCase")]
    Exception {
        message: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        status_code: Option<u16>,
    },
    /// Summary of a finished bulk insert
    #[serde(rename = "BulkInsertResult", rename_all = "PascalCase")]
    BulkInsert {
        #[serde(default)]
        total: u64,
    },
    /// Any result type this client does not interpret
    #[serde(other)]
    Other,
}

/// State of a server-side operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationState {
    pub status: OperationStatus,
    #[serde(default)]
    pub result: Option<OperationResult>,
}

impl OperationState {
    /// The server's error for this operation, if it recorded one
    pub fn error(&self) -> Option<BulkInsertError> {
        match &self.result {
            Some(OperationResult::Exception { message, error, .. }) => {
                let details = if error.is_empty() {
                    message.clone()
                } else {
                    format!("{}: {}", message, error)
                };
                Some(BulkInsertError::OperationFailed(details))
            }
            _ => None,
        }
    }
}
