//! Events surfaced from the protocol core to the layer driving it.

use crate::StreamId;

/// Things that happened to a destination as a result of the last call into it
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// A new incoming stream was created and added to the pending backlog
    IncomingStream(StreamId),
    /// Something happened on an individual stream
    Stream(StreamId, StreamEvent),
}

/// Things that happened to one stream
///
/// `Terminated` is always the last event a stream emits; after it has been
/// delivered no timer or callback for that stream will fire again.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamEvent {
    /// The handshake completed and the stream is established
    Opened,
    /// In-order data arrived and a read can make progress
    Readable,
    /// Send-queue space was freed by acknowledgements
    Writable,
    /// The peer closed its half cleanly; reads drain the remaining data
    Finished,
    /// The peer reset the stream, or retransmission was exhausted
    Reset,
    /// The stream was removed from the destination's tables
    Terminated,
}
