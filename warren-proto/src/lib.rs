//! Reliable, ordered, bidirectional byte streams over anonymous tunnels.
//!
//! This crate contains the protocol state machine: the wire codec, the
//! per-stream sequencing/congestion/retransmission logic, and the
//! destination-level demultiplexer. It performs no I/O whatsoever and never
//! reads the clock; every entry point takes an explicit [`Instant`], timer
//! deadlines are reported through [`Destination::next_timeout`], and all
//! transmission goes out through the narrow substrate interfaces in
//! [`tunnel`]. This keeps the core deterministic and directly testable, and
//! lets an I/O layer (such as the `warren` crate) drive one destination from a
//! single task.
//!
//! The substrate is expected to provide garlic-routed tunnels, leaseset
//! lookup, and per-remote routing sessions; the endpoint address is a
//! cryptographic identity ([`identity::Identity`]), not a network address.
//!
//! [`Instant`]: std::time::Instant
//! [`Destination::next_timeout`]: destination::Destination::next_timeout

#![warn(missing_docs)]

use std::fmt;

mod config;
mod packet;
mod send_buffer;
mod timer;

pub mod destination;
pub mod identity;
pub mod shared;
pub mod stream;
pub mod tunnel;

#[cfg(test)]
mod tests;

pub use crate::config::StreamingConfig;
pub use crate::destination::Destination;
pub use crate::packet::{Flags, Packet, PacketDecodeError, MAX_PACKET_SIZE};
pub use crate::send_buffer::{SendCallback, WriteError};
pub use crate::shared::{Event, StreamEvent};
pub use crate::stream::{Stream, StreamStatus};

/// Identifier for one end of a stream
///
/// Each endpoint picks a random nonzero 32-bit id for the streams it
/// receives on; the peer learns it from the first packet and echoes it in the
/// `receiveStreamID` field of everything it sends back.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(x: u32) -> Self {
        Self(x)
    }
}
