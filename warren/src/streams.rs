//! Stream handles: async and blocking send/receive over the shared state.

use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::poll_fn;
use proto::{StreamId, StreamStatus, WriteError};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::destination::DestinationRef;

/// Errors surfaced to readers
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ReadError {
    /// The peer reset the stream, or retransmission was exhausted
    #[error("stream reset")]
    Reset,
}

/// Handle to one reliable byte stream
///
/// Dropping the handle does not close the stream — the destination owns the
/// lifecycle and the close/terminate machinery runs its course either way —
/// it only releases any unread data salvaged after termination.
pub struct Stream {
    conn: DestinationRef,
    id: StreamId,
}

impl Stream {
    pub(crate) fn new(conn: DestinationRef, id: StreamId) -> Self {
        Self { conn, id }
    }

    /// The id this stream is known by at the destination
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Current lifecycle state, `Terminated` once the stream is gone
    pub fn status(&self) -> StreamStatus {
        self.conn
            .lock()
            .proto
            .stream(self.id)
            .map_or(StreamStatus::Terminated, |stream| stream.status())
    }

    /// Queue `data` and resolve once every byte has been packetized
    ///
    /// Resolving does not imply the peer acknowledged the data, only that it
    /// left the send queue; cancellation errors mean the stream died with the
    /// chunk still queued.
    pub async fn write(&self, data: Bytes) -> Result<(), WriteError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.conn.lock();
            let _ = state.proto.write(
                self.id,
                Instant::now(),
                data,
                Some(Box::new(move |result| {
                    let _ = tx.send(result);
                })),
            );
        }
        self.conn.wake();
        rx.await.unwrap_or(Err(WriteError::Cancelled))
    }

    /// Queue `data` without waiting; returns the number of bytes accepted
    pub fn send(&self, data: Bytes) -> Result<usize, WriteError> {
        let len = data.len();
        self.conn
            .lock()
            .proto
            .write(self.id, Instant::now(), data, None)?;
        self.conn.wake();
        Ok(len)
    }

    /// Attempt a read, registering the task for wakeup if nothing is ready
    ///
    /// `Ok(0)` with a non-empty `buf` means end of stream.
    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, ReadError>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut state = self.conn.lock();
        match state.proto.read(self.id, buf) {
            Some(n) if n > 0 => Poll::Ready(Ok(n)),
            read => {
                let gone = read.is_none() || state.proto.stream(self.id).is_none();
                if state.reset.contains(&self.id) {
                    Poll::Ready(Err(ReadError::Reset))
                } else if gone || state.finished.contains(&self.id) {
                    Poll::Ready(Ok(0))
                } else {
                    state.readers.insert(self.id, cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }

    /// Read up to `buf.len()` in-order bytes
    ///
    /// `Ok(0)` means end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    /// Read with a deadline; yields `Ok(0)` on timeout
    pub async fn read_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, ReadError> {
        match tokio::time::timeout(timeout, self.read(buf)).await {
            Ok(result) => result,
            Err(_) => {
                self.clear_reader();
                Ok(0)
            }
        }
    }

    /// Block the calling thread reading up to `buf.len()` bytes
    ///
    /// Returns 0 on timeout or end of stream. Must not be called from the
    /// destination's runtime thread.
    pub fn receive(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let n = block_on_poll(timeout, |cx| self.poll_read(cx, buf));
        match n {
            Some(Ok(n)) => n,
            Some(Err(_)) => 0,
            None => {
                self.clear_reader();
                0
            }
        }
    }

    /// Begin a graceful close: drain the send side, then exchange FINs
    pub fn close(&self) {
        self.conn.lock().proto.close(self.id, Instant::now());
        self.conn.wake();
    }

    /// Tear the stream down immediately, cancelling queued sends
    pub fn terminate(&self) {
        self.conn.lock().proto.terminate(self.id);
        self.conn.wake();
    }

    /// Payload bytes handed to the substrate so far
    pub fn bytes_sent(&self) -> u64 {
        self.conn
            .lock()
            .proto
            .stream(self.id)
            .map_or(0, |stream| stream.bytes_sent())
    }

    /// Payload bytes accepted from the substrate so far
    pub fn bytes_received(&self) -> u64 {
        self.conn
            .lock()
            .proto
            .stream(self.id)
            .map_or(0, |stream| stream.bytes_received())
    }

    /// Drop any interest a timed-out blocking read left behind
    fn clear_reader(&self) {
        self.conn.lock().readers.remove(&self.id);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let mut state = self.conn.lock();
        if state.proto.stream(self.id).is_none() {
            state.proto.discard(self.id);
        }
    }
}

/// A condition-variable parker turning poll-based primitives into blocking
/// calls with a deadline
#[derive(Default)]
struct Parker {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        *self.woken.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

/// Poll `f` until ready or `timeout` elapses; `None` on timeout
pub(crate) fn block_on_poll<T>(
    timeout: Duration,
    mut f: impl FnMut(&mut Context<'_>) -> Poll<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let parker = Arc::new(Parker::default());
    let waker = Waker::from(parker.clone());
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(value) = f(&mut cx) {
            return Some(value);
        }
        let mut woken = parker.woken.lock().unwrap();
        loop {
            if *woken {
                *woken = false;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = parker
                .condvar
                .wait_timeout(woken, deadline - now)
                .unwrap();
            woken = guard;
        }
    }
}
