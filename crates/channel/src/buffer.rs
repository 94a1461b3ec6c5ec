//! Pending transmission buffer
//!
//! Bounded accumulator for bytes that have been logically written but not
//! yet sent. The producer appends under the channel lock; the consumer
//! drains the whole accumulated request in one flush.

use bytes::{Bytes, BytesMut};

use crate::{ChannelError, ChannelResult};

/// Default pending-buffer capacity: 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Bounded byte accumulator for queued-but-unsent request data.
///
/// Not internally synchronized; every access must happen under the
/// channel's mutex.
#[derive(Debug)]
pub struct PendingBuffer {
    data: BytesMut,
    capacity: usize,
}

impl PendingBuffer {
    /// Create an empty buffer with the given maximum capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::new(),
            capacity,
        }
    }

    /// Append bytes to the pending data.
    ///
    /// Fails atomically when the resulting length would exceed the
    /// capacity: the buffer is left completely unmodified and the caller
    /// may retry with a smaller payload.
    pub fn append(&mut self, bytes: &[u8]) -> ChannelResult<usize> {
        if self.data.len() + bytes.len() > self.capacity {
            return Err(ChannelError::Capacity {
                requested: bytes.len(),
                pending: self.data.len(),
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Take the accumulated bytes, leaving the buffer empty.
    pub fn drain(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    /// The pending bytes, in enqueue order.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Discard everything pending.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Number of pending bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes are pending.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of bytes the buffer will hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
