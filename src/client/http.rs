//! HTTP request executor
//!
//! Speaks the server's REST endpoints with `reqwest`. Control requests (id
//! allocation, status, kill) are retried with backoff; the bulk-insert request
//! streams its body from a bounded channel fed by the session's pipeline and
//! is never retried.

use crate::bulk_insert::handshake::RequestContent;
use crate::bulk_insert::output::OutputStream;
use crate::client::operation::OperationState;
use crate::client::retry::{ControlRequest, RetryConfig};
use crate::client::RequestExecutor;
use crate::config::BulkInsertConfiguration;
use crate::error::BulkInsertError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::CONTENT_ENCODING;
use reqwest::{Body, Method, Response, StatusCode};
use serde::Deserialize;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Body chunks buffered between the pipeline and the connection
const BODY_CHANNEL_CAPACITY: usize = 4;

type BodyChunk = Result<Bytes, io::Error>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NextOperationId {
    id: i64,
}

/// [`RequestExecutor`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpRequestExecutor {
    client: reqwest::Client,
    base_url: Url,
    database: String,
    retry: RetryConfig,
    bulk_insert_timeout: Duration,
}

impl HttpRequestExecutor {
    /// Create an executor for the configured server and database
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the server URL cannot be parsed or the
    /// HTTP client cannot be built.
    pub fn new(config: &BulkInsertConfiguration) -> Result<Self, BulkInsertError> {
        let base_url = Url::parse(&config.server_url).map_err(|e| {
            BulkInsertError::ConfigurationError(format!(
                "Invalid server_url '{}': {}",
                config.server_url, e
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                BulkInsertError::ConfigurationError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            database: config.database.clone(),
            retry: RetryConfig::from_configuration(config),
            bulk_insert_timeout: Duration::from_secs(config.bulk_insert_timeout_secs),
        })
    }

    /// `{server}/databases/{db}/{path...}[?id={operation_id}]`
    fn endpoint(&self, path: &[&str], operation_id: Option<i64>) -> Result<Url, BulkInsertError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BulkInsertError::ConfigurationError(format!(
                    "server_url cannot be used as a base URL: {}",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .push("databases")
            .push(&self.database)
            .extend(path);
        if let Some(id) = operation_id {
            url.query_pairs_mut().append_pair("id", &id.to_string());
        }
        Ok(url)
    }

    /// Send a control request with retries
    ///
    /// Returns `Ok(None)` on 404.
    async fn control_request(
        &self,
        request: ControlRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Response>, BulkInsertError> {
        let (method, path): (Method, &[&str]) = match request {
            ControlRequest::NextOperationId => (Method::GET, &["operations", "next-operation-id"]),
            ControlRequest::OperationState(_) => (Method::GET, &["operations", "state"]),
            ControlRequest::KillOperation(_) => (Method::POST, &["operations", "kill"]),
        };
        let url = self.endpoint(path, request.operation_id())?;

        let attempt = || {
            let builder = self.client.request(method.clone(), url.clone());
            async move {
                let response = builder.send().await.map_err(|e| {
                    BulkInsertError::ConnectionError(format!("Request failed: {}", e))
                })?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                check_status(response).await.map(Some)
            }
        };

        self.retry.execute(request, cancel, attempt).await
    }
}

#[async_trait]
impl RequestExecutor for HttpRequestExecutor {
    async fn next_operation_id(&self, cancel: &CancellationToken) -> Result<i64, BulkInsertError> {
        let response = self
            .control_request(ControlRequest::NextOperationId, cancel)
            .await?
            .ok_or_else(|| BulkInsertError::ServerError {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: format!("Database '{}' was not found", self.database),
            })?;
        let body: NextOperationId = response.json().await.map_err(|e| {
            BulkInsertError::SerializationError(format!(
                "Failed to parse operation id response: {}",
                e
            ))
        })?;
        debug!(operation_id = body.id, "Acquired operation id");
        Ok(body.id)
    }

    async fn operation_state(
        &self,
        operation_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<OperationState>, BulkInsertError> {
        let Some(response) = self
            .control_request(ControlRequest::OperationState(operation_id), cancel)
            .await?
        else {
            return Ok(None);
        };
        let state = response.json().await.map_err(|e| {
            BulkInsertError::SerializationError(format!(
                "Failed to parse operation state: {}",
                e
            ))
        })?;
        Ok(Some(state))
    }

    async fn kill_operation(
        &self,
        operation_id: i64,
        cancel: &CancellationToken,
    ) -> Result<(), BulkInsertError> {
        match self
            .control_request(ControlRequest::KillOperation(operation_id), cancel)
            .await?
        {
            Some(_) => {
                info!(operation_id, "Kill request accepted");
                Ok(())
            }
            None => Err(BulkInsertError::OperationNotFound(operation_id)),
        }
    }

    async fn bulk_insert(
        &self,
        operation_id: i64,
        content: RequestContent,
        cancel: CancellationToken,
    ) -> Result<(), BulkInsertError> {
        let url = match self.endpoint(&["bulk_insert"], Some(operation_id)) {
            Ok(url) => url,
            Err(e) => {
                content.error_on_request_start(e.clone());
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel::<BodyChunk>(BODY_CHANNEL_CAPACITY);
        let mut request = self
            .client
            .post(url)
            .timeout(self.bulk_insert_timeout)
            .body(Body::wrap_stream(BodyChunks { rx }));
        if content.is_compressed() {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let abort_tx = tx.clone();
        let start_content = content.clone();
        let send = async move {
            let response = request.send().await.map_err(|e| {
                BulkInsertError::ConnectionError(format!("Bulk insert request failed: {}", e))
            });
            match response {
                Ok(response) => check_status(response).await.map(|_| ()),
                Err(e) => {
                    start_content.error_on_request_start(e.clone());
                    Err(e)
                }
            }
        };

        let body_cancel = cancel.clone();
        let serialize = async move {
            let result = content
                .serialize_to_stream(Box::new(ChannelOutput { tx }))
                .await;
            if let Err(e) = &result {
                // An error item aborts the body instead of ending it cleanly.
                tokio::select! {
                    _ = abort_tx.send(Err(io::Error::new(io::ErrorKind::Other, e.to_string()))) => {}
                    _ = body_cancel.cancelled() => {}
                }
            }
            result
        };

        let (sent, serialized) = tokio::select! {
            results = async { tokio::join!(send, serialize) } => results,
            _ = cancel.cancelled() => {
                return Err(BulkInsertError::Cancelled(format!(
                    "Bulk insert {} cancelled",
                    operation_id
                )));
            }
        };

        match (sent, serialized) {
            (Ok(()), Ok(())) => {
                info!(operation_id, "Bulk insert request completed");
                Ok(())
            }
            (Err(e), _) => {
                warn!(operation_id, error = %e, "Bulk insert request failed");
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
        }
    }
}

/// Map a non-success response to `ServerError`
async fn check_status(response: Response) -> Result<Response, BulkInsertError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(BulkInsertError::ServerError {
        status: status.as_u16(),
        message,
    })
}

/// Request body stream over the chunk channel
struct BodyChunks {
    rx: mpsc::Receiver<BodyChunk>,
}

impl Stream for BodyChunks {
    type Item = BodyChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Output stream handed to the session; each write becomes one body chunk
struct ChannelOutput {
    tx: mpsc::Sender<BodyChunk>,
}

#[async_trait]
impl OutputStream for ChannelOutput {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.tx
            .send(Ok(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request body was closed"))
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
