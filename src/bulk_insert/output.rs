//! Request body output streams
//!
//! [`OutputStream`] is what the transport hands to the session once it starts
//! sending the request body. [`RequestBodyWriter`] layers optional gzip
//! compression on top of it.

use crate::config::CompressionLevel;
use crate::error::BulkInsertError;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use std::io::{self, Write};

/// Live destination of the request body
#[async_trait]
pub trait OutputStream: Send {
    /// Write the whole slice, waiting for the transport to accept it
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Push any bytes buffered by the transport
    async fn flush(&mut self) -> io::Result<()>;
}

/// Body writer owned by the transmission pipeline
///
/// Holds the transport's output stream and, when enabled, a gzip encoder whose
/// output is forwarded to it after every write.
pub struct RequestBodyWriter {
    inner: Box<dyn OutputStream>,
    encoder: Option<GzEncoder<Vec<u8>>>,
    bytes_sent: u64,
}

impl RequestBodyWriter {
    pub fn new(inner: Box<dyn OutputStream>, compression: CompressionLevel) -> Self {
        Self {
            inner,
            encoder: compression
                .to_flate2()
                .map(|level| GzEncoder::new(Vec::new(), level)),
            bytes_sent: 0,
        }
    }

    /// Write uncompressed bytes to the body
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), BulkInsertError> {
        match self.encoder.as_mut() {
            Some(encoder) => {
                encoder.write_all(data)?;
                let compressed = std::mem::take(encoder.get_mut());
                self.send(&compressed).await
            }
            None => self.send(data).await,
        }
    }

    /// Write the gzip trailer, if compressing
    ///
    /// No further writes are accepted after this.
    pub async fn finish(&mut self) -> Result<(), BulkInsertError> {
        if let Some(encoder) = self.encoder.take() {
            let rest = encoder.finish()?;
            self.send(&rest).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), BulkInsertError> {
        self.inner.flush().await.map_err(|e| {
            BulkInsertError::TransmissionError(format!("Failed to flush request body: {}", e))
        })
    }

    /// Bytes handed to the transport so far (after compression)
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), BulkInsertError> {
        if data.is_empty() {
            return Ok(());
        }
        self.inner.write_all(data).await.map_err(|e| {
            BulkInsertError::TransmissionError(format!("Failed to write request body: {}", e))
        })?;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }
}
