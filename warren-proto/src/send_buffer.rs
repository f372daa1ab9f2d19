use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Completion callback attached to a queued send
///
/// Fired exactly once: with `Ok(())` when the last byte of the chunk has been
/// packetized, or with [`WriteError::Cancelled`] if the stream goes away
/// first.
pub type SendCallback = Box<dyn FnOnce(Result<(), WriteError>) + Send>;

/// Errors surfaced to writers
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum WriteError {
    /// The stream no longer accepts data
    #[error("stream closed")]
    Closed,
    /// The stream was terminated with this chunk still queued
    #[error("send cancelled")]
    Cancelled,
}

/// One application-supplied chunk awaiting packetization
struct SendBuffer {
    data: Bytes,
    on_complete: Option<SendCallback>,
}

impl SendBuffer {
    fn complete(mut self, result: Result<(), WriteError>) {
        if let Some(callback) = self.on_complete.take() {
            callback(result);
        }
    }
}

/// FIFO of outgoing chunks with a running byte total
///
/// Chunks are consumed whole where possible; when a packet boundary lands
/// inside a chunk, the head is split and its tail stays queued.
#[derive(Default)]
pub(crate) struct SendBufferQueue {
    buffers: VecDeque<SendBuffer>,
    size: usize,
}

impl SendBufferQueue {
    pub(crate) fn add(&mut self, data: Bytes, on_complete: Option<SendCallback>) {
        self.size += data.len();
        self.buffers.push_back(SendBuffer { data, on_complete });
    }

    /// Move up to `max` bytes into `out`, firing completions for every chunk
    /// consumed whole
    pub(crate) fn drain_into(&mut self, out: &mut Vec<u8>, max: usize) -> usize {
        let mut copied = 0;
        while copied < max {
            let Some(head) = self.buffers.front_mut() else {
                break;
            };
            let rem = head.data.len();
            if copied + rem <= max {
                out.extend_from_slice(&head.data);
                copied += rem;
                self.buffers.pop_front().unwrap().complete(Ok(()));
            } else {
                let take = max - copied;
                out.extend_from_slice(&head.data[..take]);
                head.data.advance(take);
                copied = max;
            }
        }
        self.size -= copied;
        copied
    }

    /// Fire every pending completion with a cancellation and empty the queue
    pub(crate) fn cancel_all(&mut self) {
        for buffer in self.buffers.drain(..) {
            buffer.complete(Err(WriteError::Cancelled));
        }
        self.size = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes queued and not yet packetized
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for SendBufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendBufferQueue")
            .field("buffers", &self.buffers.len())
            .field("size", &self.size)
            .finish()
    }
}
