//! Integration tests for retry logic

use docdb_bulk_insert::client::retry::{ControlRequest, RetryConfig};
use docdb_bulk_insert::BulkInsertError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_retry_succeeds_on_first_attempt() {
    let config = RetryConfig::default();
    let result = config
        .execute(ControlRequest::NextOperationId, &CancellationToken::new(), || async {
            Ok::<_, BulkInsertError>(42_i64)
        })
        .await;
    assert_eq!(assert_ok!(result), 42);
}

#[tokio::test]
async fn test_retry_exhausted_names_the_request() {
    let config = RetryConfig::new(3, 1, 10);
    let mut attempts = 0;
    let result = config
        .execute(ControlRequest::OperationState(12), &CancellationToken::new(), || {
            attempts += 1;
            async { Err::<(), _>(BulkInsertError::ConnectionError("refused".to_string())) }
        })
        .await;
    let err = assert_err!(result);
    assert!(matches!(err, BulkInsertError::RetryExhausted(_)));
    assert!(err.to_string().contains("operation state of 12"));
    assert!(err.to_string().contains("refused"));
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let config = RetryConfig::default();
    let mut attempts = 0;
    let result = config
        .execute(ControlRequest::KillOperation(7), &CancellationToken::new(), || {
            attempts += 1;
            async { Err::<(), _>(BulkInsertError::OperationNotFound(7)) }
        })
        .await;
    // Returned unchanged so callers can match on it
    assert!(matches!(
        assert_err!(result),
        BulkInsertError::OperationNotFound(7)
    ));
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_unavailable_server_is_retried() {
    let config = RetryConfig::new(5, 1, 10);
    let mut attempts = 0;
    let result = config
        .execute(ControlRequest::NextOperationId, &CancellationToken::new(), || {
            attempts += 1;
            let current = attempts;
            async move {
                if current < 3 {
                    Err(BulkInsertError::ServerError {
                        status: 503,
                        message: "unavailable".to_string(),
                    })
                } else {
                    Ok(current)
                }
            }
        })
        .await;
    assert_eq!(assert_ok!(result), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let config = RetryConfig::new(5, 1, 10);
    let mut attempts = 0;
    let result = config
        .execute(ControlRequest::NextOperationId, &CancellationToken::new(), || {
            attempts += 1;
            async {
                Err::<(), _>(BulkInsertError::ServerError {
                    status: 400,
                    message: "bad request".to_string(),
                })
            }
        })
        .await;
    assert!(matches!(
        result,
        Err(BulkInsertError::ServerError { status: 400, .. })
    ));
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_delays_are_bounded() {
    let mut config = RetryConfig::new(4, 5, 10);
    config.jitter = false;
    let start = Instant::now();
    let _ = config
        .execute(ControlRequest::NextOperationId, &CancellationToken::new(), || async {
            Err::<(), _>(BulkInsertError::ConnectionError("refused".to_string()))
        })
        .await;
    // 5 + 10 + 10 ms between four attempts
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(25));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let mut config = RetryConfig::new(5, 10_000, 10_000);
    config.jitter = false;
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let mut attempts = 0;
    let result = config
        .execute(ControlRequest::KillOperation(3), &cancel, || {
            attempts += 1;
            async { Err::<(), _>(BulkInsertError::ConnectionError("reset".to_string())) }
        })
        .await;
    assert!(matches!(result, Err(BulkInsertError::Cancelled(_))));
    assert_eq!(attempts, 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}
