//! Common test utilities and test doubles
//!
//! [`ScriptedExecutor`] stands in for the server. It hands out operation ids,
//! records the streamed request body and can be told to fail in the ways a
//! real server or network fails.

#![allow(dead_code)]

use async_trait::async_trait;
use docdb_bulk_insert::bulk_insert::handshake::RequestContent;
use docdb_bulk_insert::bulk_insert::output::OutputStream;
use docdb_bulk_insert::client::operation::{OperationResult, OperationState, OperationStatus};
use docdb_bulk_insert::{
    BulkInsertClient, BulkInsertConfiguration, BulkInsertError, RequestExecutor,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counters shared by every output stream a [`ScriptedExecutor`] hands out
#[derive(Debug, Default)]
pub struct WriteStats {
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub writes: AtomicUsize,
    pub failed: AtomicBool,
}

/// Output stream that records writes and tracks their overlap
pub struct RecordingStream {
    body: Arc<Mutex<Vec<u8>>>,
    stats: Arc<WriteStats>,
    delay: Duration,
    fail_after: Option<usize>,
}

#[async_trait]
impl OutputStream for RecordingStream {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let completed = self.stats.writes.fetch_add(1, Ordering::SeqCst);
        let result = match self.fail_after {
            Some(limit) if completed >= limit => {
                self.stats.failed.store(true, Ordering::SeqCst);
                Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ))
            }
            _ => {
                self.body.lock().unwrap().extend_from_slice(data);
                Ok(())
            }
        };

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory server
pub struct ScriptedExecutor {
    next_id: AtomicI64,
    pub id_requests: AtomicUsize,
    pub state_requests: AtomicUsize,
    pub kill_requests: AtomicUsize,
    pub bulk_insert_requests: AtomicUsize,
    pub compressed: AtomicBool,
    pub body: Arc<Mutex<Vec<u8>>>,
    pub writes: Arc<WriteStats>,
    id_delay: Duration,
    write_delay: Duration,
    fail_after: Option<usize>,
    start_error: Option<BulkInsertError>,
    execution_error: Option<BulkInsertError>,
    remote_state: Option<OperationState>,
    kill_not_found: bool,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            id_requests: AtomicUsize::new(0),
            state_requests: AtomicUsize::new(0),
            kill_requests: AtomicUsize::new(0),
            bulk_insert_requests: AtomicUsize::new(0),
            compressed: AtomicBool::new(false),
            body: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(WriteStats::default()),
            id_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            fail_after: None,
            start_error: None,
            execution_error: None,
            remote_state: None,
            kill_not_found: false,
        }
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation id allocation
    pub fn with_id_delay(mut self, delay: Duration) -> Self {
        self.id_delay = delay;
        self
    }

    /// Delay every body write
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Fail every body write after `writes` successful ones
    pub fn failing_after(mut self, writes: usize) -> Self {
        self.fail_after = Some(writes);
        self
    }

    /// Fail the request before its body is requested
    pub fn with_start_error(mut self, error: BulkInsertError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Fail the request after its body was fully received
    pub fn with_execution_error(mut self, error: BulkInsertError) -> Self {
        self.execution_error = Some(error);
        self
    }

    /// Report the operation as faulted with `message` on status queries
    pub fn with_remote_error(mut self, message: &str) -> Self {
        self.remote_state = Some(OperationState {
            status: OperationStatus::Faulted,
            result: Some(OperationResult::Exception {
                message: message.to_string(),
                error: String::new(),
                status_code: Some(400),
            }),
        });
        self
    }

    pub fn with_kill_not_found(mut self) -> Self {
        self.kill_not_found = true;
        self
    }

    /// Body received so far, as text
    pub fn body_text(&self) -> String {
        String::from_utf8(self.body.lock().unwrap().clone()).unwrap()
    }

    /// Body received so far, parsed as a JSON array
    pub fn body_json(&self) -> Vec<serde_json::Value> {
        serde_json::from_slice(&self.body.lock().unwrap()).unwrap()
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn next_operation_id(&self, _cancel: &CancellationToken) -> Result<i64, BulkInsertError> {
        self.id_requests.fetch_add(1, Ordering::SeqCst);
        if !self.id_delay.is_zero() {
            tokio::time::sleep(self.id_delay).await;
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn operation_state(
        &self,
        _operation_id: i64,
        _cancel: &CancellationToken,
    ) -> Result<Option<OperationState>, BulkInsertError> {
        self.state_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.remote_state.clone())
    }

    async fn kill_operation(
        &self,
        operation_id: i64,
        _cancel: &CancellationToken,
    ) -> Result<(), BulkInsertError> {
        self.kill_requests.fetch_add(1, Ordering::SeqCst);
        if self.kill_not_found {
            return Err(BulkInsertError::OperationNotFound(operation_id));
        }
        Ok(())
    }

    async fn bulk_insert(
        &self,
        _operation_id: i64,
        content: RequestContent,
        _cancel: CancellationToken,
    ) -> Result<(), BulkInsertError> {
        self.bulk_insert_requests.fetch_add(1, Ordering::SeqCst);
        self.compressed
            .store(content.is_compressed(), Ordering::SeqCst);

        if let Some(error) = &self.start_error {
            content.error_on_request_start(error.clone());
            return Err(error.clone());
        }

        let stream = RecordingStream {
            body: Arc::clone(&self.body),
            stats: Arc::clone(&self.writes),
            delay: self.write_delay,
            fail_after: self.fail_after,
        };
        let result = content.serialize_to_stream(Box::new(stream)).await;

        if self.writes.failed.load(Ordering::SeqCst) {
            return Err(BulkInsertError::ConnectionError(
                "Connection reset by peer".to_string(),
            ));
        }
        result?;
        match &self.execution_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Test configuration pointing nowhere; the executor is always scripted
pub fn create_test_config() -> BulkInsertConfiguration {
    BulkInsertConfiguration::new(
        "http://localhost:8080".to_string(),
        "Northwind".to_string(),
    )
}

/// Client over `executor` with the given configuration
pub fn client_with(
    executor: &Arc<ScriptedExecutor>,
    config: BulkInsertConfiguration,
) -> BulkInsertClient {
    let executor: Arc<dyn RequestExecutor> = executor.clone();
    BulkInsertClient::with_executor(config, executor).unwrap()
}
