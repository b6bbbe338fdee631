//! Client entry point and request execution
//!
//! [`BulkInsertClient`] holds everything sessions share: the configuration,
//! the request executor, the document conventions and the buffer pool. Each
//! call to [`BulkInsertClient::bulk_insert`] opens a new, cheap session; no
//! network activity happens until the first document is stored.

pub mod http;
pub mod operation;
pub mod retry;

use crate::bulk_insert::buffer::BufferPool;
use crate::bulk_insert::handshake::RequestContent;
use crate::bulk_insert::BulkInsertSession;
use crate::client::http::HttpRequestExecutor;
use crate::client::operation::OperationState;
use crate::config::BulkInsertConfiguration;
use crate::conventions::Conventions;
use crate::error::BulkInsertError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Server requests issued by a bulk-insert session
///
/// Implementations own transport concerns (retries, timeouts, topology).
/// Every method observes the given cancellation token.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Allocate a new operation id for a bulk insert
    async fn next_operation_id(&self, cancel: &CancellationToken) -> Result<i64, BulkInsertError>;

    /// Fetch the operation's state
    ///
    /// Returns `Ok(None)` when the server does not know the operation.
    async fn operation_state(
        &self,
        operation_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<OperationState>, BulkInsertError>;

    /// Kill a running operation
    ///
    /// # Errors
    ///
    /// Returns `OperationNotFound` when the server does not know the operation.
    async fn kill_operation(
        &self,
        operation_id: i64,
        cancel: &CancellationToken,
    ) -> Result<(), BulkInsertError>;

    /// Send the bulk-insert request and wait for the server to execute it
    ///
    /// The implementation must call [`RequestContent::serialize_to_stream`]
    /// once it is ready to send the body, or
    /// [`RequestContent::error_on_request_start`] if the request fails before
    /// that. Resolves when the server has answered.
    async fn bulk_insert(
        &self,
        operation_id: i64,
        content: RequestContent,
        cancel: CancellationToken,
    ) -> Result<(), BulkInsertError>;
}

/// Factory for bulk-insert sessions against one database
#[derive(Clone)]
pub struct BulkInsertClient {
    config: Arc<BulkInsertConfiguration>,
    executor: Arc<dyn RequestExecutor>,
    conventions: Arc<Conventions>,
    buffer_pool: Arc<BufferPool>,
}

impl BulkInsertClient {
    /// Create a client speaking HTTP to the configured server
    ///
    /// # Arguments
    ///
    /// * `config` - Client configuration
    ///
    /// # Returns
    ///
    /// Returns `BulkInsertClient` instance ready to open sessions.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the configuration is invalid or the
    /// HTTP client cannot be built.
    pub fn new(config: BulkInsertConfiguration) -> Result<Self, BulkInsertError> {
        config.validate()?;
        let executor = HttpRequestExecutor::new(&config)?;
        info!(
            server_url = %config.server_url,
            database = %config.database,
            compression = ?config.compression,
            "Initializing BulkInsertClient"
        );
        Ok(Self::assemble(config, Arc::new(executor)))
    }

    /// Create a client over a custom request executor
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the configuration is invalid.
    pub fn with_executor(
        config: BulkInsertConfiguration,
        executor: Arc<dyn RequestExecutor>,
    ) -> Result<Self, BulkInsertError> {
        config.validate()?;
        Ok(Self::assemble(config, executor))
    }

    fn assemble(config: BulkInsertConfiguration, executor: Arc<dyn RequestExecutor>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
            conventions: Arc::new(Conventions::default()),
            buffer_pool: Arc::new(BufferPool::default()),
        }
    }

    /// Replace the document conventions used by new sessions
    pub fn with_conventions(mut self, conventions: Conventions) -> Self {
        self.conventions = Arc::new(conventions);
        self
    }

    /// Open a new bulk-insert session
    pub fn bulk_insert(&self) -> BulkInsertSession {
        self.bulk_insert_with_cancellation(CancellationToken::new())
    }

    /// Open a new bulk-insert session observing `cancel`
    ///
    /// Cancelling the token faults the session. It must then be disposed.
    pub fn bulk_insert_with_cancellation(&self, cancel: CancellationToken) -> BulkInsertSession {
        BulkInsertSession::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.conventions),
            Arc::clone(&self.buffer_pool),
            self.config.compression,
            self.config.max_buffer_size,
            cancel,
        )
    }

    pub fn config(&self) -> &BulkInsertConfiguration {
        &self.config
    }

    /// Buffer pool shared by this client's sessions
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }
}
