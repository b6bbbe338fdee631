//! Server-side error recovery
//!
//! A failed write on the client is often the consequence of the server
//! rejecting the batch and closing the connection. Before a local error is
//! reported, the operation's recorded state is fetched; a terminal error
//! result found there is the authoritative cause.

use crate::client::RequestExecutor;
use crate::error::BulkInsertError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fetch the server's recorded error for an operation, if any
///
/// # Returns
///
/// `Ok(Some(error))` when the server holds an error result for the operation,
/// `Ok(None)` when it holds none or does not know the operation.
///
/// # Errors
///
/// Transport errors of the status query are returned unchanged.
pub async fn exception_from_operation(
    executor: &dyn RequestExecutor,
    operation_id: i64,
    cancel: &CancellationToken,
) -> Result<Option<BulkInsertError>, BulkInsertError> {
    let state = executor.operation_state(operation_id, cancel).await?;

    let Some(state) = state else {
        debug!(operation_id, "Operation state not found on the server");
        return Ok(None);
    };

    match state.error() {
        Some(error) => {
            warn!(operation_id, status = ?state.status, error = %error, "Server reported bulk insert failure");
            Ok(Some(error))
        }
        None => {
            debug!(operation_id, status = ?state.status, "Server reported no error for bulk insert");
            Ok(None)
        }
    }
}
