//! Request body handshake
//!
//! The transport pulls the request body when it is ready to send; the session
//! pushes commands whenever the application stores them. [`ContentHandshake`]
//! (session side) and [`RequestContent`] (transport side) connect the two:
//!
//! - the transport calls [`RequestContent::serialize_to_stream`] with its live
//!   output stream, which resolves the session's
//!   [`ContentHandshake::output_stream`] future and then parks until the
//!   session signals completion;
//! - the session calls [`ContentHandshake::mark_done`] once it has written
//!   the closing `]`, which lets the transport finish the request.
//!
//! Failures travel both ways: the transport can reject the stream future
//! before sending starts, and the session can fail the transport side with the
//! error that broke the stream. Releasing the handshake cancels anything still
//! waiting.

use crate::bulk_insert::output::OutputStream;
use crate::config::CompressionLevel;
use crate::error::BulkInsertError;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type StreamResult = Result<Box<dyn OutputStream>, BulkInsertError>;

#[derive(Debug, Clone)]
enum Completion {
    Pending,
    Done,
    Failed(BulkInsertError),
    Cancelled,
}

struct HandshakeState {
    stream_tx: Mutex<Option<oneshot::Sender<StreamResult>>>,
    completion: watch::Sender<Completion>,
    compression: CompressionLevel,
}

impl HandshakeState {
    /// Move from `Pending` to `next`; false if already settled
    fn settle(&self, next: Completion) -> bool {
        self.completion.send_if_modified(|current| {
            if matches!(current, Completion::Pending) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn take_stream_sender(&self) -> Option<oneshot::Sender<StreamResult>> {
        self.stream_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Session side of the handshake
pub struct ContentHandshake {
    state: Arc<HandshakeState>,
    output_stream: Option<oneshot::Receiver<StreamResult>>,
}

impl ContentHandshake {
    pub fn new(compression: CompressionLevel) -> Self {
        let (stream_tx, stream_rx) = oneshot::channel();
        let (completion, _) = watch::channel(Completion::Pending);
        Self {
            state: Arc::new(HandshakeState {
                stream_tx: Mutex::new(Some(stream_tx)),
                completion,
                compression,
            }),
            output_stream: Some(stream_rx),
        }
    }

    /// Transport-facing half, handed to the request executor
    pub fn content(&self) -> RequestContent {
        RequestContent {
            state: Arc::clone(&self.state),
        }
    }

    /// Wait until the transport starts sending and yields its output stream
    ///
    /// # Errors
    ///
    /// - the transport's error if it failed before the body started
    /// - `ConnectionError` if the transport dropped the request without starting it
    /// - `Cancelled` if `cancel` fires first
    /// - `ProtocolViolation` if the stream was already taken
    pub async fn output_stream(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn OutputStream>, BulkInsertError> {
        let receiver = self.output_stream.take().ok_or_else(|| {
            BulkInsertError::ProtocolViolation("Output stream was already taken".to_string())
        })?;

        tokio::select! {
            received = receiver => match received {
                Ok(stream) => stream,
                Err(_) => Err(BulkInsertError::ConnectionError(
                    "Request ended before the body stream was opened".to_string(),
                )),
            },
            _ = cancel.cancelled() => Err(BulkInsertError::Cancelled(
                "Cancelled while waiting for the request body stream".to_string(),
            )),
        }
    }

    /// Signal that no more data will be written
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the handshake was already completed,
    /// failed or released.
    pub fn mark_done(&self) -> Result<(), BulkInsertError> {
        if self.state.settle(Completion::Done) {
            debug!("Request body marked as done");
            Ok(())
        } else {
            Err(BulkInsertError::ProtocolViolation(
                "Unable to close the stream".to_string(),
            ))
        }
    }

    /// Fail the transport side with the error that broke the body stream
    pub fn error_on_processing_request(&self, error: BulkInsertError) {
        if !self.state.settle(Completion::Failed(error)) {
            debug!("Request body already settled, processing error not delivered");
        }
    }

    /// Cancel every waiter that has not completed yet
    ///
    /// Safe to call more than once.
    pub fn release(&self) {
        if let Some(sender) = self.state.take_stream_sender() {
            let _ = sender.send(Err(BulkInsertError::Cancelled(
                "Bulk insert session was released".to_string(),
            )));
        }
        self.state.settle(Completion::Cancelled);
    }
}

impl Drop for ContentHandshake {
    fn drop(&mut self) {
        self.release();
    }
}

/// Transport side of the handshake
#[derive(Clone)]
pub struct RequestContent {
    state: Arc<HandshakeState>,
}

impl RequestContent {
    /// Whether the body will be gzip-encoded
    pub fn is_compressed(&self) -> bool {
        self.state.compression.is_enabled()
    }

    /// Hand the live output stream to the session and wait for it to finish
    ///
    /// Called by the transport exactly once, when it starts sending the
    /// request body. Resolves when the session marks the body done.
    ///
    /// # Errors
    ///
    /// - the error the session reported through `error_on_processing_request`
    /// - `Cancelled` if the session was released first
    /// - `ProtocolViolation` if the body was already started
    pub async fn serialize_to_stream(
        &self,
        stream: Box<dyn OutputStream>,
    ) -> Result<(), BulkInsertError> {
        let sender = self.state.take_stream_sender().ok_or_else(|| {
            BulkInsertError::ProtocolViolation("Request body was already started".to_string())
        })?;

        let mut completion = self.state.completion.subscribe();
        if sender.send(Ok(stream)).is_err() {
            return Err(BulkInsertError::Cancelled(
                "Bulk insert session was released before the body started".to_string(),
            ));
        }

        let settled = {
            let settled = completion
                .wait_for(|c| !matches!(c, Completion::Pending))
                .await
                .map_err(|_| {
                    BulkInsertError::Cancelled("Bulk insert session went away".to_string())
                })?;
            settled.clone()
        };

        match settled {
            Completion::Done | Completion::Pending => Ok(()),
            Completion::Failed(error) => Err(error),
            Completion::Cancelled => Err(BulkInsertError::Cancelled(
                "Bulk insert session was released".to_string(),
            )),
        }
    }

    /// Reject the session's stream future with a transport error
    ///
    /// No effect once the stream was handed over.
    pub fn error_on_request_start(&self, error: BulkInsertError) {
        if let Some(sender) = self.state.take_stream_sender() {
            let _ = sender.send(Err(error));
        }
    }
}
