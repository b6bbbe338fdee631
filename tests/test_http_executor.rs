//! Integration tests for the HTTP request executor against a mock server

use docdb_bulk_insert::client::http::HttpRequestExecutor;
use docdb_bulk_insert::client::operation::OperationStatus;
use docdb_bulk_insert::{
    BulkInsertClient, BulkInsertConfiguration, BulkInsertError, CompressionLevel,
    RequestExecutor,
};
use flate2::read::GzDecoder;
use serde_json::{json, Value};
use std::io::Read;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DB: &str = "/databases/Northwind";

fn config_for(server: &MockServer) -> BulkInsertConfiguration {
    BulkInsertConfiguration::new(server.uri(), "Northwind".to_string())
        .with_retry_config(3, 1, 10)
}

async fn mount_operation_id(server: &MockServer, id: i64) {
    Mock::given(method("GET"))
        .and(path(format!("{}/operations/next-operation-id", DB)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Id": id })))
        .mount(server)
        .await;
}

async fn bulk_insert_body(server: &MockServer) -> Vec<u8> {
    let requests = server.received_requests().await.unwrap();
    requests
        .into_iter()
        .find(|r| r.url.path().ends_with("/bulk_insert"))
        .map(|r| r.body)
        .unwrap()
}

#[tokio::test]
async fn test_session_streams_documents_over_http() {
    let server = MockServer::start().await;
    mount_operation_id(&server, 42).await;
    Mock::given(method("POST"))
        .and(path(format!("{}/bulk_insert", DB)))
        .and(query_param("id", "42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = BulkInsertClient::new(config_for(&server)).unwrap();
    let session = client.bulk_insert();
    session
        .store_with_id(&json!({"Name": "Ada"}), "users/1", None)
        .await
        .unwrap();
    session
        .store_with_id(&json!({"Name": "Grace"}), "users/2", None)
        .await
        .unwrap();
    session.dispose().await.unwrap();
    assert_eq!(session.operation_id(), Some(42));

    let commands: Vec<Value> = serde_json::from_slice(&bulk_insert_body(&server).await).unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0]["Id"], "users/1");
    assert_eq!(commands[1]["Document"]["Name"], "Grace");
}

#[tokio::test]
async fn test_compressed_body_is_advertised() {
    let server = MockServer::start().await;
    mount_operation_id(&server, 7).await;
    Mock::given(method("POST"))
        .and(path(format!("{}/bulk_insert", DB)))
        .and(header("content-encoding", "gzip"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server).with_compression(CompressionLevel::Optimal);
    let client = BulkInsertClient::new(config).unwrap();
    let session = client.bulk_insert();
    session
        .store_with_id(&json!({"Name": "Ada"}), "users/1", None)
        .await
        .unwrap();
    session.dispose().await.unwrap();

    let compressed = bulk_insert_body(&server).await;
    let mut decoded = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut decoded)
        .unwrap();
    let commands: Vec<Value> = serde_json::from_str(&decoded).unwrap();
    assert_eq!(commands[0]["Id"], "users/1");
}

#[tokio::test]
async fn test_failed_execution_reports_server_error_first() {
    let server = MockServer::start().await;
    mount_operation_id(&server, 9).await;
    Mock::given(method("POST"))
        .and(path(format!("{}/bulk_insert", DB)))
        .respond_with(ResponseTemplate::new(400).set_body_string("validation failed"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/operations/state", DB)))
        .and(query_param("id", "9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Status": "Faulted",
            "Result": {
                "$type": "OperationExceptionResult",
                "Message": "Bulk insert failed",
                "Error": "Document users/1 has no Name",
                "StatusCode": 400
            }
        })))
        .mount(&server)
        .await;

    let client = BulkInsertClient::new(config_for(&server)).unwrap();
    let session = client.bulk_insert();
    session
        .store_with_id(&json!({}), "users/1", None)
        .await
        .unwrap();
    let err = session.dispose().await.unwrap_err();

    let causes = err.causes();
    assert!(matches!(causes[0], BulkInsertError::OperationFailed(_)));
    assert!(causes[0].to_string().contains("has no Name"));
    assert!(matches!(
        causes[1],
        BulkInsertError::ServerError { status: 400, .. }
    ));
}

#[tokio::test]
async fn test_operation_id_retried_on_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/operations/next-operation-id", DB)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_operation_id(&server, 11).await;

    let executor = HttpRequestExecutor::new(&config_for(&server)).unwrap();
    let id = executor
        .next_operation_id(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(id, 11);
}

#[tokio::test]
async fn test_operation_state_not_found_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/operations/state", DB)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let executor = HttpRequestExecutor::new(&config_for(&server)).unwrap();
    let state = executor
        .operation_state(5, &CancellationToken::new())
        .await
        .unwrap();
    assert!(state.is_none());
}

#[tokio::test]
async fn test_operation_state_in_progress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/operations/state", DB)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"Status": "InProgress", "Result": null})),
        )
        .mount(&server)
        .await;

    let executor = HttpRequestExecutor::new(&config_for(&server)).unwrap();
    let state = executor
        .operation_state(5, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, OperationStatus::InProgress);
    assert!(state.error().is_none());
}

#[tokio::test]
async fn test_kill_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/operations/kill", DB)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let executor = HttpRequestExecutor::new(&config_for(&server)).unwrap();
    let result = executor.kill_operation(3, &CancellationToken::new()).await;
    assert!(matches!(result, Err(BulkInsertError::OperationNotFound(3))));
}

#[tokio::test]
async fn test_kill_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{}/operations/kill", DB)))
        .and(query_param("id", "3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let executor = HttpRequestExecutor::new(&config_for(&server)).unwrap();
    executor
        .kill_operation(3, &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_control_request_cancelled() {
    let server = MockServer::start().await;
    mount_operation_id(&server, 1).await;

    let executor = HttpRequestExecutor::new(&config_for(&server)).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = executor.next_operation_id(&cancel).await;
    assert!(matches!(result, Err(BulkInsertError::Cancelled(_))));
}
