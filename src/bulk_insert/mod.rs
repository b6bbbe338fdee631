//! Bulk-insert session
//!
//! A [`BulkInsertSession`] streams documents to the server as a single
//! long-lived request. It is created without any network activity. The first
//! store allocates the operation id, starts the request and waits for its body
//! stream; every store then encodes one command into the active buffer of the
//! [`TransmissionPipeline`](pipeline::TransmissionPipeline). Disposal closes
//! the array, drains the pipeline and waits for the server to finish the
//! operation.
//!
//! # Example
//!
//! ```no_run
//! use docdb_bulk_insert::{BulkInsertClient, BulkInsertConfiguration};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct User {
//!     #[serde(rename = "Name")]
//!     name: String,
//! }
//!
//! # async fn example() -> Result<(), docdb_bulk_insert::BulkInsertError> {
//! let config = BulkInsertConfiguration::new(
//!     "http://localhost:8080".to_string(),
//!     "Northwind".to_string(),
//! );
//! let client = BulkInsertClient::new(config)?;
//! let session = client.bulk_insert();
//! session
//!     .store_with_id(&User { name: "Ada".to_string() }, "users/1", None)
//!     .await?;
//! session.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod command;
pub mod handshake;
pub mod output;
pub mod pipeline;
pub mod recovery;

use crate::bulk_insert::buffer::BufferPool;
use crate::bulk_insert::command::PutCommand;
use crate::bulk_insert::handshake::ContentHandshake;
use crate::bulk_insert::output::RequestBodyWriter;
use crate::bulk_insert::pipeline::TransmissionPipeline;
use crate::client::RequestExecutor;
use crate::config::CompressionLevel;
use crate::conventions::{
    verify_valid_id, Conventions, EntityEncoder, Metadata, ENTITY_ID_FIELD, METADATA_COLLECTION,
    METADATA_ID,
};
use crate::error::BulkInsertError;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Operation id value before the server assigned one
const NO_OPERATION_ID: i64 = -1;

/// Lifecycle of a session
///
/// `Completed`, `Faulted` and `Aborted` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    AcquiringId,
    StreamEstablished,
    Writing,
    Closing,
    Completed,
    Faulted,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Faulted | SessionState::Aborted
        )
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct BulkInsertStatistics {
    /// Server-assigned operation id, once acquired
    pub operation_id: Option<i64>,
    pub state: SessionState,
    /// Documents accepted by `store`
    pub documents_stored: u64,
    /// Command bytes encoded, before compression
    pub bytes_encoded: u64,
    /// Buffer swaps issued by the pipeline
    pub swaps: u64,
    /// When the session left `Created`
    pub started_at: Option<DateTime<Utc>>,
}

struct Status {
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
}

/// Everything touched by store and dispose, serialized by the session lock
struct SessionInner {
    handshake: ContentHandshake,
    pipeline: Option<TransmissionPipeline>,
    execute_task: Option<JoinHandle<Result<(), BulkInsertError>>>,
    first: bool,
}

/// Rejects a second store while one is running
struct StoreGuard<'a>(&'a AtomicBool);

impl<'a> StoreGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, BulkInsertError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                BulkInsertError::ConcurrencyViolation(
                    "Store in bulk insert concurrently is forbidden".to_string(),
                )
            })?;
        Ok(Self(flag))
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type Disposal = Shared<BoxFuture<'static, Result<(), BulkInsertError>>>;

/// One streaming bulk insert
///
/// Created by [`BulkInsertClient::bulk_insert`](crate::BulkInsertClient::bulk_insert).
/// Call [`dispose`](Self::dispose) when done; dropping a session without
/// disposing it abandons the request.
pub struct BulkInsertSession {
    core: Arc<SessionCore>,
    /// Shutdown task shared by every `dispose` caller, set by the first one
    disposal: StdMutex<Option<Disposal>>,
}

/// Session state shared with the shutdown task
struct SessionCore {
    executor: Arc<dyn RequestExecutor>,
    conventions: Arc<Conventions>,
    buffer_pool: Arc<BufferPool>,
    compression: CompressionLevel,
    max_buffer_size: usize,
    cancel: CancellationToken,
    operation_id: AtomicI64,
    store_in_progress: AtomicBool,
    status: StdMutex<Status>,
    documents_stored: AtomicU64,
    bytes_encoded: AtomicU64,
    swaps: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl BulkInsertSession {
    /// Create a session; nothing is sent until the first store
    ///
    /// # Arguments
    ///
    /// * `executor` - Server request executor
    /// * `conventions` - Id generation, collection naming and custom encoders
    /// * `buffer_pool` - Pool the two encoding buffers are leased from
    /// * `compression` - Request body compression
    /// * `max_buffer_size` - Active buffer size that forces a swap
    /// * `cancel` - Observed by every suspension point of the session
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        conventions: Arc<Conventions>,
        buffer_pool: Arc<BufferPool>,
        compression: CompressionLevel,
        max_buffer_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        let core = SessionCore {
            executor,
            conventions,
            buffer_pool,
            compression,
            max_buffer_size,
            cancel,
            operation_id: AtomicI64::new(NO_OPERATION_ID),
            store_in_progress: AtomicBool::new(false),
            status: StdMutex::new(Status {
                state: SessionState::Created,
                started_at: None,
            }),
            documents_stored: AtomicU64::new(0),
            bytes_encoded: AtomicU64::new(0),
            swaps: AtomicU64::new(0),
            inner: Mutex::new(SessionInner {
                handshake: ContentHandshake::new(compression),
                pipeline: None,
                execute_task: None,
                first: true,
            }),
        };
        Self {
            core: Arc::new(core),
            disposal: StdMutex::new(None),
        }
    }

    /// Store an entity, resolving its id
    ///
    /// The id is taken from the `@id` metadata entry, then the entity's `Id`
    /// field, and is otherwise generated by the conventions' id generator.
    ///
    /// # Returns
    ///
    /// Returns the id the document was stored under.
    ///
    /// # Errors
    ///
    /// See [`store_with_id`](Self::store_with_id).
    pub async fn store<T>(
        &self,
        entity: &T,
        metadata: Option<Metadata>,
    ) -> Result<String, BulkInsertError>
    where
        T: Serialize + ?Sized,
    {
        self.core.store_document(entity, None, metadata, None).await
    }

    /// Store an entity under an explicit id
    ///
    /// # Errors
    ///
    /// - `ConcurrencyViolation` if another store on this session is running
    /// - `InvalidIdentifier` if `id` is empty or ends with `|`, before any network activity
    /// - `SerializationError` if the entity cannot be converted to JSON
    /// - transport errors of id acquisition or stream establishment, unchanged
    /// - `Aborted` if the command could not be encoded or transmitted, wrapping
    ///   the server's recorded error when one is available
    pub async fn store_with_id<T>(
        &self,
        entity: &T,
        id: &str,
        metadata: Option<Metadata>,
    ) -> Result<String, BulkInsertError>
    where
        T: Serialize + ?Sized,
    {
        self.core.store_document(entity, Some(id), metadata, None).await
    }

    /// Store an entity with a per-call encoder
    ///
    /// `encoder` takes precedence over the session-wide encoder; when it
    /// declines an entity, the default serde_json encoding is used.
    pub async fn store_with_encoder<T>(
        &self,
        entity: &T,
        id: Option<&str>,
        metadata: Option<Metadata>,
        encoder: &dyn EntityEncoder,
    ) -> Result<String, BulkInsertError>
    where
        T: Serialize + ?Sized,
    {
        self.core
            .store_document(entity, id, metadata, Some(encoder))
            .await
    }

    /// Kill the server-side operation
    ///
    /// No effect if no operation id was acquired yet.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` if the server does not know the operation; other
    /// transport errors unchanged.
    pub async fn abort(&self) -> Result<(), BulkInsertError> {
        self.core.abort().await
    }

    /// Finish the bulk insert and release the session's resources
    ///
    /// Shutdown runs once, in its own task. Concurrent and repeated calls wait
    /// for and return its outcome; a caller that stops waiting, for example on
    /// a timeout, does not interrupt it.
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation` if the request body could not be completed
    /// - `Aborted("Failed to execute bulk insert")` wrapping, in order, the
    ///   server's recorded error, the execution error and the flush error
    pub async fn dispose(&self) -> Result<(), BulkInsertError> {
        let disposal = {
            let mut disposal = self
                .disposal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            disposal
                .get_or_insert_with(|| {
                    let core = Arc::clone(&self.core);
                    let task = tokio::spawn(async move { core.shutdown().await });
                    async move {
                        task.await.unwrap_or_else(|e| {
                            Err(BulkInsertError::TransmissionError(format!(
                                "Bulk insert shutdown task failed: {}",
                                e
                            )))
                        })
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        disposal.await
    }

    /// Server-assigned operation id, once acquired
    pub fn operation_id(&self) -> Option<i64> {
        self.core.operation_id()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn statistics(&self) -> BulkInsertStatistics {
        self.core.statistics()
    }
}

impl SessionCore {
    async fn store_document<T>(
        &self,
        entity: &T,
        id: Option<&str>,
        metadata: Option<Metadata>,
        encoder: Option<&dyn EntityEncoder>,
    ) -> Result<String, BulkInsertError>
    where
        T: Serialize + ?Sized,
    {
        let _guard = StoreGuard::acquire(&self.store_in_progress)?;

        if let Some(id) = id {
            verify_valid_id(id)?;
        }

        let mut document = serde_json::to_value(entity)?;
        let mut metadata = metadata.unwrap_or_default();
        if !metadata.contains_key(METADATA_COLLECTION) {
            metadata.insert(
                METADATA_COLLECTION.to_string(),
                Value::String(self.conventions.collection_name::<T>()),
            );
        }

        let id = match id {
            Some(id) => id.to_string(),
            None => {
                let id = self.resolve_id(&mut document, &metadata).await?;
                verify_valid_id(&id)?;
                id
            }
        };

        let mut inner = self.inner.lock().await;
        self.ensure_writable()?;

        if inner.pipeline.is_none() {
            if let Err(e) = self.establish_stream(&mut inner).await {
                error!(error = %e, "Failed to start bulk insert");
                self.transition(SessionState::Faulted);
                return Err(e);
            }
        }

        let encoder = encoder.or(self.conventions.entity_encoder.as_deref());
        let command = PutCommand {
            id: &id,
            document: &document,
            metadata: &metadata,
        };
        match self.write_command(&mut inner, &command, encoder).await {
            Ok(()) => {
                self.documents_stored.fetch_add(1, Ordering::Relaxed);
                self.transition(SessionState::Writing);
                Ok(id)
            }
            Err(e) => Err(self.fail_store(&mut inner, &id, e).await),
        }
    }

    /// Id for an entity stored without an explicit one
    ///
    /// A generated id is written back into the entity's `Id` field when that
    /// field exists and is null.
    async fn resolve_id(
        &self,
        document: &mut Value,
        metadata: &Metadata,
    ) -> Result<String, BulkInsertError> {
        if let Some(id) = metadata.get(METADATA_ID).and_then(Value::as_str) {
            return Ok(id.to_string());
        }
        if let Some(id) = document.get(ENTITY_ID_FIELD).and_then(Value::as_str) {
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }

        let collection = metadata
            .get(METADATA_COLLECTION)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let id = self
            .conventions
            .id_generator
            .generate_document_id(collection, document)
            .await?;

        if let Some(field) = document.get_mut(ENTITY_ID_FIELD) {
            if field.is_null() {
                *field = Value::String(id.clone());
            }
        }
        Ok(id)
    }

    fn ensure_writable(&self) -> Result<(), BulkInsertError> {
        match self.state() {
            SessionState::Faulted => Err(BulkInsertError::aborted(
                "Bulk insert session is faulted; dispose it and start a new one",
            )),
            SessionState::Aborted => Err(BulkInsertError::aborted(
                "Bulk insert operation was aborted",
            )),
            SessionState::Closing | SessionState::Completed => Err(
                BulkInsertError::ProtocolViolation("Bulk insert session is already closed".to_string()),
            ),
            _ if self.cancel.is_cancelled() => {
                self.transition(SessionState::Faulted);
                Err(BulkInsertError::Cancelled(
                    "Bulk insert session was cancelled".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Allocate the operation id if it is not known yet
    async fn wait_for_id(&self) -> Result<i64, BulkInsertError> {
        let current = self.operation_id.load(Ordering::Acquire);
        if current != NO_OPERATION_ID {
            return Ok(current);
        }

        self.transition(SessionState::AcquiringId);
        let operation_id = tokio::select! {
            id = self.executor.next_operation_id(&self.cancel) => id?,
            _ = self.cancel.cancelled() => {
                return Err(BulkInsertError::Cancelled(
                    "Cancelled while acquiring the operation id".to_string(),
                ));
            }
        };
        self.operation_id.store(operation_id, Ordering::Release);
        info!(operation_id, "Bulk insert operation started");
        Ok(operation_id)
    }

    /// Start the request and wait for its body stream
    async fn establish_stream(&self, inner: &mut SessionInner) -> Result<(), BulkInsertError> {
        if inner.execute_task.is_some() {
            return Err(BulkInsertError::ProtocolViolation(
                "A previous store stopped while the request body stream was being opened"
                    .to_string(),
            ));
        }
        let operation_id = self.wait_for_id().await?;

        let executor = Arc::clone(&self.executor);
        let content = inner.handshake.content();
        let cancel = self.cancel.clone();
        let task = inner.execute_task.insert(tokio::spawn(async move {
            executor.bulk_insert(operation_id, content, cancel).await
        }));

        let opened = tokio::select! {
            biased;
            stream = inner.handshake.output_stream(&self.cancel) => Ok(stream),
            joined = task => Err(joined),
        };
        let stream = match opened {
            Ok(stream) => stream?,
            // The request ended without ever asking for its body
            Err(joined) => {
                inner.execute_task = None;
                return Err(match joined {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => BulkInsertError::ProtocolViolation(
                        "Bulk insert request finished before its body was sent".to_string(),
                    ),
                    Err(e) => BulkInsertError::TransmissionError(format!(
                        "Bulk insert task failed: {}",
                        e
                    )),
                });
            }
        };

        let writer = RequestBodyWriter::new(stream, self.compression);
        let mut pipeline = TransmissionPipeline::new(
            writer,
            self.buffer_pool.acquire(),
            self.buffer_pool.acquire(),
            self.max_buffer_size,
            self.cancel.clone(),
        );
        pipeline.current_mut().push(b'[');
        inner.pipeline = Some(pipeline);
        self.transition(SessionState::StreamEstablished);
        debug!(operation_id, compression = ?self.compression, "Bulk insert stream established");
        Ok(())
    }

    async fn write_command(
        &self,
        inner: &mut SessionInner,
        command: &PutCommand<'_>,
        encoder: Option<&dyn EntityEncoder>,
    ) -> Result<(), BulkInsertError> {
        let first = inner.first;
        let pipeline = inner.pipeline.as_mut().ok_or_else(|| {
            BulkInsertError::ProtocolViolation("Request body stream is not established".to_string())
        })?;

        let before = pipeline.current_mut().len();
        command.encode(pipeline.current_mut(), first, encoder)?;
        let encoded = pipeline.current_mut().len() - before;
        inner.first = false;
        self.bytes_encoded
            .fetch_add(encoded as u64, Ordering::Relaxed);

        if pipeline.flush_if_needed().await? {
            self.swaps.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Fault the session after a failed store and build the error to report
    ///
    /// The server's recorded error takes precedence over the local one. The
    /// transport side is failed so the request ends with an error instead of
    /// a truncated body.
    async fn fail_store(
        &self,
        inner: &mut SessionInner,
        id: &str,
        local: BulkInsertError,
    ) -> BulkInsertError {
        self.transition(SessionState::Faulted);
        error!(document_id = id, error = %local, "Failed to write document to bulk insert stream");

        let remote = match self.operation_id() {
            Some(operation_id) => {
                recovery::exception_from_operation(self.executor.as_ref(), operation_id, &self.cancel)
                    .await
            }
            None => Ok(None),
        };

        let message = format!("Write to stream failed at document with id {}.", id);
        let write_failure = BulkInsertError::aborted_with(message.clone(), vec![local.clone()]);

        if let Some(pipeline) = inner.pipeline.take() {
            self.return_buffers(pipeline);
        }
        inner
            .handshake
            .error_on_processing_request(write_failure.clone());
        let transport = match inner.execute_task.take() {
            Some(task) => self.await_execution(task).await,
            None => Ok(()),
        };

        match remote {
            Err(query_error) => query_error,
            Ok(Some(remote)) => BulkInsertError::aborted_with(message, vec![remote, local]),
            Ok(None) => match transport {
                Err(BulkInsertError::Aborted { .. }) | Ok(()) => write_failure,
                Err(transport) => BulkInsertError::aborted_with(message, vec![transport, local]),
            },
        }
    }

    async fn abort(&self) -> Result<(), BulkInsertError> {
        let Some(operation_id) = self.operation_id() else {
            debug!("Abort requested before any document was stored, nothing to kill");
            return Ok(());
        };

        match self.executor.kill_operation(operation_id, &self.cancel).await {
            Ok(()) => {
                warn!(operation_id, "Bulk insert operation aborted");
                self.transition(SessionState::Aborted);
                Ok(())
            }
            Err(BulkInsertError::OperationNotFound(_)) => Err(BulkInsertError::aborted(
                "Unable to kill this bulk insert operation, because it was not found on the server.",
            )),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self) -> Result<(), BulkInsertError> {
        let mut inner = self.inner.lock().await;
        let result = self.close_and_execute(&mut inner).await;

        inner.handshake.release();
        if let Some(pipeline) = inner.pipeline.take() {
            self.return_buffers(pipeline);
        }
        if let Some(task) = inner.execute_task.take() {
            task.abort();
        }

        match &result {
            Ok(()) => {
                self.transition(SessionState::Completed);
                info!(
                    operation_id = ?self.operation_id(),
                    documents = self.documents_stored.load(Ordering::Relaxed),
                    "Bulk insert session disposed"
                );
            }
            Err(e) => {
                self.transition(SessionState::Faulted);
                error!(operation_id = ?self.operation_id(), error = %e, "Bulk insert failed");
            }
        }
        result
    }

    async fn close_and_execute(&self, inner: &mut SessionInner) -> Result<(), BulkInsertError> {
        let state = self.state();
        if matches!(state, SessionState::Faulted | SessionState::Aborted) {
            debug!(?state, "Skipping close of a failed bulk insert session");
            return Ok(());
        }
        self.transition(SessionState::Closing);

        let mut flush_error = None;
        if let Some(pipeline) = inner.pipeline.as_mut() {
            pipeline.current_mut().push(b']');
            if let Err(e) = pipeline.close().await {
                warn!(error = %e, "Failed to flush bulk insert stream");
                flush_error = Some(e);
            }
        }

        inner.handshake.mark_done()?;

        let Some(operation_id) = self.operation_id() else {
            return Ok(());
        };
        let Some(task) = inner.execute_task.take() else {
            return Ok(());
        };

        let execution_error = match self.await_execution(task).await {
            Ok(()) => {
                if let Some(e) = flush_error {
                    warn!(operation_id, error = %e, "Bulk insert succeeded despite a flush error");
                }
                return Ok(());
            }
            Err(e) => e,
        };

        let mut causes = Vec::with_capacity(3);
        match recovery::exception_from_operation(self.executor.as_ref(), operation_id, &self.cancel)
            .await
        {
            Ok(Some(remote)) => causes.push(remote),
            Ok(None) => {}
            Err(e) => warn!(operation_id, error = %e, "Unable to query bulk insert state"),
        }
        causes.push(execution_error);
        causes.extend(flush_error);
        Err(BulkInsertError::aborted_with(
            "Failed to execute bulk insert",
            causes,
        ))
    }

    async fn await_execution(
        &self,
        mut task: JoinHandle<Result<(), BulkInsertError>>,
    ) -> Result<(), BulkInsertError> {
        tokio::select! {
            joined = &mut task => joined.unwrap_or_else(|e| {
                Err(BulkInsertError::TransmissionError(format!(
                    "Bulk insert task failed: {}",
                    e
                )))
            }),
            _ = self.cancel.cancelled() => {
                task.abort();
                Err(BulkInsertError::Cancelled(
                    "Cancelled while waiting for the bulk insert to complete".to_string(),
                ))
            }
        }
    }

    fn return_buffers(&self, pipeline: TransmissionPipeline) {
        for buffer in pipeline.into_buffers() {
            self.buffer_pool.release(buffer);
        }
    }

    /// Move to `next` unless the session already reached a final state
    fn transition(&self, next: SessionState) {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if status.state.is_terminal() || status.state == next {
            return;
        }
        if status.started_at.is_none() {
            status.started_at = Some(Utc::now());
        }
        debug!(from = ?status.state, to = ?next, "Bulk insert session state change");
        status.state = next;
    }

    fn operation_id(&self) -> Option<i64> {
        match self.operation_id.load(Ordering::Acquire) {
            NO_OPERATION_ID => None,
            id => Some(id),
        }
    }

    fn state(&self) -> SessionState {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    fn statistics(&self) -> BulkInsertStatistics {
        let (state, started_at) = {
            let status = self
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (status.state, status.started_at)
        };
        BulkInsertStatistics {
            operation_id: self.operation_id(),
            state,
            documents_stored: self.documents_stored.load(Ordering::Relaxed),
            bytes_encoded: self.bytes_encoded.load(Ordering::Relaxed),
            swaps: self.swaps.load(Ordering::Relaxed),
            started_at,
        }
    }
}

impl Drop for BulkInsertSession {
    fn drop(&mut self) {
        let disposing = self
            .disposal
            .get_mut()
            .map(|disposal| disposal.is_some())
            .unwrap_or(true);
        if disposing {
            return;
        }
        let Ok(mut inner) = self.core.inner.try_lock() else {
            return;
        };
        if let Some(task) = inner.execute_task.take() {
            warn!(
                operation_id = ?self.core.operation_id(),
                "Bulk insert session dropped without dispose, abandoning the request"
            );
            task.abort();
        }
    }
}
