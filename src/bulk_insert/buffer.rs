//! Encoding buffers and the pool they are leased from
//!
//! A session holds exactly two [`EncodingBuffer`]s. They are moved, never
//! shared, between the encoder and the in-flight write.

use std::io;
use std::sync::Mutex;
use tracing::debug;

/// Initial capacity of a freshly allocated buffer
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Resettable in-memory sink for serialized command JSON
#[derive(Debug, Default)]
pub struct EncodingBuffer {
    bytes: Vec<u8>,
}

impl EncodingBuffer {
    /// Create an empty buffer with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Number of bytes written since the last reset
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Move the cursor back to zero, keeping the allocation
    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Drop everything written after `len`
    ///
    /// Used to roll back a partially encoded command.
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }

    fn capacity(&self) -> usize {
        self.bytes.capacity()
    }
}

impl io::Write for EncodingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Bounded pool of encoding buffers shared by every session of a client
///
/// Sessions lease their two buffers on stream establishment and give them
/// back once during disposal, so a sequence of sessions reuses the same
/// allocations.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<EncodingBuffer>>,
    max_pooled: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    /// Create a pool
    ///
    /// # Arguments
    ///
    /// * `max_pooled` - Maximum number of idle buffers kept
    /// * `max_retained_capacity` - Buffers that grew beyond this are freed instead of pooled
    pub fn new(max_pooled: usize, max_retained_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
            max_retained_capacity,
        }
    }

    /// Take a reset buffer from the pool or allocate a new one
    pub fn acquire(&self) -> EncodingBuffer {
        let pooled = self
            .buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        pooled.unwrap_or_else(|| EncodingBuffer::with_capacity(INITIAL_CAPACITY))
    }

    /// Return a buffer to the pool
    pub fn release(&self, mut buffer: EncodingBuffer) {
        if buffer.capacity() > self.max_retained_capacity {
            debug!(
                "Dropping oversized encoding buffer ({} bytes) instead of pooling it",
                buffer.capacity()
            );
            return;
        }
        buffer.reset();
        let mut buffers = self
            .buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }

    /// Number of idle buffers currently pooled
    pub fn idle(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(8, 4 * 1024 * 1024)
    }
}
