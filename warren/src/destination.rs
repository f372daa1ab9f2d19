//! Async wrapper around a protocol destination.
//!
//! All protocol state lives in one mutex-guarded [`State`]; a driver task
//! services timers and dispatches protocol events to blocked readers and
//! acceptors. Public entry points lock, mutate, and nudge the driver — the
//! equivalent of posting work onto a per-destination reactor, so every state
//! transition still happens under one serialization point.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::future::poll_fn;
use proto::tunnel::{Compression, LeaseSet, LocalDestination};
use proto::{Event, StreamEvent, StreamId, StreamingConfig};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::trace;

use crate::streams::{block_on_poll, Stream};

/// Callback invoked with each accepted incoming stream
pub type Acceptor = Box<dyn FnMut(Stream) + Send>;
type AcceptOnce = Box<dyn FnOnce(Stream) + Send>;

pub(crate) struct State {
    pub(crate) proto: proto::Destination,
    pub(crate) readers: FxHashMap<StreamId, Waker>,
    pub(crate) finished: FxHashSet<StreamId>,
    pub(crate) reset: FxHashSet<StreamId>,
    accept_wakers: Vec<Waker>,
    acceptor: Option<Acceptor>,
    accept_once: VecDeque<AcceptOnce>,
    closed: bool,
}

pub(crate) struct DestinationInner {
    pub(crate) state: Mutex<State>,
    driver: Notify,
}

#[derive(Clone)]
pub(crate) struct DestinationRef(pub(crate) Arc<DestinationInner>);

impl DestinationRef {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap()
    }

    /// Nudge the driver after mutating protocol state
    pub(crate) fn wake(&self) {
        self.0.driver.notify_one();
    }
}

/// Streaming endpoint bound to one local identity
///
/// Dropping the handle tears down every stream and stops the driver.
pub struct Destination {
    inner: DestinationRef,
}

impl Destination {
    /// Set up streaming for `local` and spawn the driver task
    ///
    /// Must be called within a Tokio runtime. Data messages we emit carry
    /// `local_port` as their source port.
    pub fn new(
        local: Arc<dyn LocalDestination>,
        config: StreamingConfig,
        compression: Arc<dyn Compression>,
        local_port: u16,
    ) -> Self {
        let inner = DestinationRef(Arc::new(DestinationInner {
            state: Mutex::new(State {
                proto: proto::Destination::new(local, config, compression, local_port),
                readers: FxHashMap::default(),
                finished: FxHashSet::default(),
                reset: FxHashSet::default(),
                accept_wakers: Vec::new(),
                acceptor: None,
                accept_once: VecDeque::new(),
                closed: false,
            }),
            driver: Notify::new(),
        }));
        tokio::spawn(drive(inner.clone()));
        Self { inner }
    }

    /// Feed one inbound data-message payload from the substrate
    pub fn handle_data_payload(&self, data: &[u8]) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.proto.handle_data_payload(Instant::now(), data);
        drop(state);
        self.inner.wake();
    }

    /// Open a stream toward `remote`'s destination port `port`
    ///
    /// The handshake goes out with the first write.
    pub fn connect(&self, remote: Arc<dyn LeaseSet>, port: u16) -> Stream {
        let id = self.inner.lock().proto.create_outgoing_stream(remote, port);
        Stream::new(self.inner.clone(), id)
    }

    /// Take the next incoming stream
    ///
    /// Resolves to `None` once the destination is closed.
    pub async fn accept(&self) -> Option<Stream> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Option<Stream>> {
        let mut state = self.inner.lock();
        if let Some(id) = state.proto.accept() {
            return Poll::Ready(Some(Stream::new(self.inner.clone(), id)));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.accept_wakers.push(cx.waker().clone());
        Poll::Pending
    }

    /// Block the calling thread for the next incoming stream
    ///
    /// Returns `None` on timeout or once the destination is closed. Must not
    /// be called from the driver's runtime thread.
    pub fn accept_stream(&self, timeout: Duration) -> Option<Stream> {
        block_on_poll(timeout, |cx| self.poll_accept(cx)).flatten()
    }

    /// Hand every incoming stream (queued and future) to `acceptor`
    pub fn set_acceptor(&self, acceptor: Acceptor) {
        self.inner.lock().acceptor = Some(acceptor);
        self.inner.wake();
    }

    /// Remove the acceptor; later incoming streams queue for [`accept`]
    ///
    /// [`accept`]: Destination::accept
    pub fn reset_acceptor(&self) {
        self.inner.lock().acceptor = None;
    }

    /// Hand exactly one incoming stream to `acceptor`, ahead of the
    /// persistent acceptor
    pub fn accept_once(&self, acceptor: impl FnOnce(Stream) + Send + 'static) {
        self.inner.lock().accept_once.push_back(Box::new(acceptor));
        self.inner.wake();
    }

    /// Fire a signed echo request at `remote`
    pub fn send_ping(&self, remote: Arc<dyn LeaseSet>) {
        self.inner.lock().proto.send_ping(Instant::now(), remote);
        self.inner.wake();
    }

    /// Close a stream by id, trying a FIN first; `false` if unknown
    pub fn delete_stream(&self, id: StreamId) -> bool {
        let deleted = self.inner.lock().proto.delete_stream(id, Instant::now());
        self.inner.wake();
        deleted
    }

    /// Re-announce our leaseset to every open peer after it changed
    pub fn send_updated_lease_set(&self) {
        self.inner.lock().proto.send_updated_lease_set(Instant::now());
        self.inner.wake();
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.inner.lock().proto.len()
    }

    /// Terminate every stream and stop the driver
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.proto.stop();
        for (_, waker) in state.readers.drain() {
            waker.wake();
        }
        for waker in state.accept_wakers.drain(..) {
            waker.wake();
        }
        drop(state);
        self.inner.wake();
    }
}

impl Drop for Destination {
    fn drop(&mut self) {
        self.close();
    }
}

/// Service timers and push protocol events out to wakers and acceptors
async fn drive(inner: DestinationRef) {
    loop {
        let (deadline, calls, shared) = {
            let mut state = inner.lock();
            if state.closed {
                break;
            }
            let now = Instant::now();
            state.proto.handle_timeout(now);
            let (calls, shared) = dispatch_events(&mut state, &inner);
            (state.proto.next_timeout(), calls, shared)
        };
        // user callbacks run outside the lock so they may use their stream
        run_acceptors(&inner, calls, shared);
        let notified = inner.0.driver.notified();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => notified.await,
        }
    }
    trace!("destination driver stopped");
}

enum AcceptCall {
    Once(AcceptOnce, Stream),
    Shared(Stream),
}

fn dispatch_events(
    state: &mut State,
    inner: &DestinationRef,
) -> (Vec<AcceptCall>, Option<Acceptor>) {
    let mut incoming = false;
    while let Some(event) = state.proto.poll_event() {
        match event {
            Event::IncomingStream(_) => incoming = true,
            Event::Stream(id, event) => {
                match event {
                    StreamEvent::Finished | StreamEvent::Terminated => {
                        state.finished.insert(id);
                    }
                    StreamEvent::Reset => {
                        state.finished.insert(id);
                        state.reset.insert(id);
                    }
                    StreamEvent::Opened | StreamEvent::Readable | StreamEvent::Writable => {}
                }
                if let Some(waker) = state.readers.remove(&id) {
                    waker.wake();
                }
            }
        }
    }
    // one-shot acceptors first, then the persistent one, then whoever is
    // parked in accept(); an acceptor installed late still drains the backlog
    let mut calls = Vec::new();
    loop {
        if state.accept_once.is_empty() && state.acceptor.is_none() {
            break;
        }
        let Some(id) = state.proto.accept() else {
            break;
        };
        let stream = Stream::new(inner.clone(), id);
        match state.accept_once.pop_front() {
            Some(acceptor) => calls.push(AcceptCall::Once(acceptor, stream)),
            None => calls.push(AcceptCall::Shared(stream)),
        }
    }
    if incoming {
        for waker in state.accept_wakers.drain(..) {
            waker.wake();
        }
    }
    let shared = if calls.iter().any(|c| matches!(c, AcceptCall::Shared(_))) {
        state.acceptor.take()
    } else {
        None
    };
    (calls, shared)
}

fn run_acceptors(inner: &DestinationRef, calls: Vec<AcceptCall>, mut shared: Option<Acceptor>) {
    for call in calls {
        match call {
            AcceptCall::Once(acceptor, stream) => acceptor(stream),
            AcceptCall::Shared(stream) => {
                if let Some(acceptor) = shared.as_mut() {
                    acceptor(stream);
                }
            }
        }
    }
    if let Some(acceptor) = shared {
        let mut state = inner.lock();
        if state.acceptor.is_none() {
            state.acceptor = Some(acceptor);
        }
    }
}
