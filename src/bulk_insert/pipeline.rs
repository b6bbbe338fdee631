//! Double-buffered transmission pipeline
//!
//! The application encodes commands into the active buffer while the
//! previously filled buffer is written to the request body by a background
//! task. The background task owns that buffer and the body writer for the
//! duration of the write and hands both back when it completes, so the
//! encoder can never touch bytes that are being transmitted.
//!
//! ```text
//!  store() ──encode──► [ current ]            [ spare ] ◄── reset on swap
//!                          │ swap                 ▲
//!                          ▼                      │
//!                  spawn(write buffer) ───────────┘ returned with the writer
//! ```
//!
//! At most one write is in flight. A swap first waits for the previous write
//! to finish, which is the only backpressure on the producer.

use crate::bulk_insert::buffer::EncodingBuffer;
use crate::bulk_insert::output::RequestBodyWriter;
use crate::error::BulkInsertError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one background write, with ownership of its resources returned
struct CompletedWrite {
    writer: RequestBodyWriter,
    buffer: EncodingBuffer,
    result: Result<(), BulkInsertError>,
}

enum WriterSlot {
    /// No write in flight; the writer and the spare buffer are at rest
    Idle {
        writer: RequestBodyWriter,
        spare: EncodingBuffer,
    },
    InFlight(JoinHandle<CompletedWrite>),
    /// Writer closed or lost to a failed write; the spare buffer if it survived
    Closed(Option<EncodingBuffer>),
}

/// Owner of the two encoding buffers and the request body writer
pub struct TransmissionPipeline {
    current: EncodingBuffer,
    slot: WriterSlot,
    max_buffer_size: usize,
    cancel: CancellationToken,
    swaps: u64,
}

impl TransmissionPipeline {
    /// Create a pipeline over an established request body
    ///
    /// # Arguments
    ///
    /// * `writer` - Request body writer (possibly compressing)
    /// * `current` - Buffer that starts out active
    /// * `spare` - Buffer that starts out idle
    /// * `max_buffer_size` - Active buffer size that forces a swap
    /// * `cancel` - Session cancellation token, observed by every write
    pub fn new(
        writer: RequestBodyWriter,
        mut current: EncodingBuffer,
        mut spare: EncodingBuffer,
        max_buffer_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        current.reset();
        spare.reset();
        Self {
            current,
            slot: WriterSlot::Idle { writer, spare },
            max_buffer_size,
            cancel,
            swaps: 0,
        }
    }

    /// Active buffer, for encoding
    pub fn current_mut(&mut self) -> &mut EncodingBuffer {
        &mut self.current
    }

    /// Number of swaps issued so far
    pub fn swaps(&self) -> u64 {
        self.swaps
    }

    /// True when no write is outstanding
    fn write_completed(&self) -> bool {
        match &self.slot {
            WriterSlot::Idle { .. } => true,
            WriterSlot::InFlight(handle) => handle.is_finished(),
            WriterSlot::Closed(_) => false,
        }
    }

    /// Swap if the active buffer is over the threshold or the network is idle
    ///
    /// Returns true if a swap was issued.
    pub async fn flush_if_needed(&mut self) -> Result<bool, BulkInsertError> {
        if self.current.len() > self.max_buffer_size || self.write_completed() {
            self.swap().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Hand the active buffer to a new background write
    ///
    /// Waits for the previous write first.
    pub async fn swap(&mut self) -> Result<(), BulkInsertError> {
        let (writer, mut spare) = self.wait_for_pending().await?;

        spare.reset();
        std::mem::swap(&mut self.current, &mut spare);
        let filled = spare;

        debug!(
            bytes = filled.len(),
            swap = self.swaps + 1,
            "Swapping encoding buffers"
        );
        self.swaps += 1;
        self.slot = WriterSlot::InFlight(tokio::spawn(transmit(
            writer,
            filled,
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Write whatever is left and finish the body
    ///
    /// Waits for the in-flight write, writes the active buffer directly,
    /// finishes compression and flushes. The body writer is dropped afterwards
    /// whether or not this succeeds, which ends the request body on the
    /// transport side.
    pub async fn close(&mut self) -> Result<(), BulkInsertError> {
        let (mut writer, spare) = self.wait_for_pending().await?;
        self.slot = WriterSlot::Closed(Some(spare));

        let current = &self.current;
        tokio::select! {
            result = async {
                writer.write_all(current.as_slice()).await?;
                writer.finish().await?;
                writer.flush().await
            } => result,
            _ = self.cancel.cancelled() => Err(BulkInsertError::Cancelled(
                "Cancelled while flushing the request body".to_string(),
            )),
        }
    }

    /// Tear down the pipeline and return whatever buffers can be reused
    ///
    /// An in-flight write is aborted.
    pub fn into_buffers(self) -> Vec<EncodingBuffer> {
        let mut buffers = vec![self.current];
        match self.slot {
            WriterSlot::Idle { spare, .. } => buffers.push(spare),
            WriterSlot::Closed(Some(spare)) => buffers.push(spare),
            WriterSlot::Closed(None) => {}
            WriterSlot::InFlight(handle) => {
                warn!("Discarding pipeline with a write still in flight");
                handle.abort();
            }
        }
        buffers
    }

    /// Wait for the outstanding write and take back the writer and spare buffer
    ///
    /// The in-flight handle stays in its slot until the write has finished, so
    /// a caller that stops waiting leaves the write to be picked up by the next
    /// one.
    async fn wait_for_pending(
        &mut self,
    ) -> Result<(RequestBodyWriter, EncodingBuffer), BulkInsertError> {
        if let WriterSlot::InFlight(handle) = &mut self.slot {
            let joined = handle.await;
            self.slot = match joined {
                Ok(CompletedWrite {
                    writer,
                    buffer,
                    result: Ok(()),
                }) => WriterSlot::Idle {
                    writer,
                    spare: buffer,
                },
                Ok(CompletedWrite {
                    buffer,
                    result: Err(e),
                    ..
                }) => {
                    self.slot = WriterSlot::Closed(Some(buffer));
                    return Err(e);
                }
                Err(e) => {
                    self.slot = WriterSlot::Closed(None);
                    return Err(BulkInsertError::TransmissionError(format!(
                        "Background write task failed: {}",
                        e
                    )));
                }
            };
        }

        match std::mem::replace(&mut self.slot, WriterSlot::Closed(None)) {
            WriterSlot::Idle { writer, spare } => Ok((writer, spare)),
            other => {
                self.slot = other;
                Err(BulkInsertError::TransmissionError(
                    "Request body is closed".to_string(),
                ))
            }
        }
    }
}

/// Background write of one filled buffer
async fn transmit(
    mut writer: RequestBodyWriter,
    buffer: EncodingBuffer,
    cancel: CancellationToken,
) -> CompletedWrite {
    let result = tokio::select! {
        result = writer.write_all(buffer.as_slice()) => result,
        _ = cancel.cancelled() => Err(BulkInsertError::Cancelled(
            "Cancelled while writing the request body".to_string(),
        )),
    };
    CompletedWrite {
        writer,
        buffer,
        result,
    }
}
