//! Reliable, ordered, bidirectional byte streams over anonymous tunnels, for
//! Tokio.
//!
//! This crate is the I/O layer over [`warren-proto`]: it owns the lock around
//! each protocol [`Destination`], runs the driver task that services timers
//! and dispatches protocol events, and exposes async (plus blocking
//! convenience) send, receive, and accept operations. Everything
//! substrate-facing — tunnels, leasesets, garlic sessions — still comes from
//! the embedder through the traits in [`proto::tunnel`].
//!
//! The entry point is [`Destination`]; open streams with
//! [`Destination::connect`], take inbound ones with
//! [`Destination::accept`] or an acceptor callback, and feed inbound
//! data-message payloads to [`Destination::handle_data_payload`].
//!
//! [`warren-proto`]: proto

#![warn(missing_docs)]

mod destination;
mod streams;


pub use proto::{
    identity, tunnel, Event, StreamEvent, StreamId, StreamStatus, StreamingConfig, WriteError,
};

pub use crate::destination::{Acceptor, Destination};
pub use crate::streams::{ReadError, Stream};
