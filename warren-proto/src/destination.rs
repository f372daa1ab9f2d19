//! Destination-level demultiplexer.
//!
//! One [`Destination`] owns every stream terminating at a local identity: it
//! routes inbound packets to the right [`Stream`], creates streams for
//! inbound SYNs, parks follow-on packets that arrive before their SYN,
//! answers pings, and recycles packet buffers. Like the rest of the crate it
//! is driven entirely by the embedder: feed it packets and timer expirations,
//! drain [`Event`]s.
//!
//! The whole structure is meant to live under one lock owned by the I/O
//! layer; any thread may then inspect the stream table for metrics while all
//! mutation happens on the driving task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::config::StreamingConfig;
use crate::packet::{Packet, PacketDecodeError, PacketPool};
use crate::send_buffer::{SendCallback, WriteError};
use crate::shared::{Event, StreamEvent};
use crate::stream::{Stream, StreamStatus};
use crate::tunnel::{Compression, LeaseSet, LocalDestination};
use crate::StreamId;

/// Protocol discriminator carried in data messages
const PROTOCOL_STREAMING: u8 = 6;

/// Builds the data messages handed to the routing session
///
/// Layout: payload length (4), source port (2), destination port (2),
/// protocol (1), then the compressed stream packet. The garlic/I2NP envelope
/// around this is the substrate's job, as is routing inbound messages by port
/// back to [`Destination::handle_data_payload`].
pub(crate) struct DataMessageFactory {
    local_port: u16,
    compression: Arc<dyn Compression>,
}

impl DataMessageFactory {
    pub(crate) fn create(&self, payload: &[u8], to_port: u16) -> Bytes {
        let mut body = Vec::with_capacity(payload.len() + 16);
        body.put_u32(0); // patched below
        body.put_u16(self.local_port);
        body.put_u16(to_port);
        body.put_u8(PROTOCOL_STREAMING);
        self.compression.deflate(payload, &mut body);
        let len = (body.len() - 4) as u32;
        body[0..4].copy_from_slice(&len.to_be_bytes());
        body.into()
    }
}

/// Follow-on packets held for a SYN that has not arrived yet
struct OrphanBucket {
    packets: Vec<Packet>,
    deadline: Instant,
}

/// All streaming state for one local destination
pub struct Destination {
    config: Arc<StreamingConfig>,
    local: Arc<dyn LocalDestination>,
    msg_factory: Arc<DataMessageFactory>,
    rng: StdRng,
    pool: PacketPool,

    /// Every live stream, keyed by our receive stream id
    streams: FxHashMap<u32, Stream>,
    /// Incoming streams, keyed by the peer's receive stream id
    incoming: FxHashMap<u32, u32>,
    /// Our receive id of the stream the last packet landed on
    last_stream: Option<u32>,
    /// Follow-on packets whose SYN we have not seen, by the peer's receive id
    orphans: FxHashMap<u32, OrphanBucket>,
    /// Accepted-but-unclaimed incoming streams, oldest first
    pending_incoming: VecDeque<u32>,
    pending_incoming_deadline: Option<Instant>,
    /// In-order data a stream never got to deliver before it was removed
    residue: FxHashMap<u32, Vec<u8>>,

    events: VecDeque<Event>,
}

impl Destination {
    /// Set up streaming for `local`, sourcing data messages from `local_port`
    pub fn new(
        local: Arc<dyn LocalDestination>,
        config: StreamingConfig,
        compression: Arc<dyn Compression>,
        local_port: u16,
    ) -> Self {
        Self {
            config: Arc::new(config),
            local,
            msg_factory: Arc::new(DataMessageFactory {
                local_port,
                compression,
            }),
            rng: StdRng::from_entropy(),
            pool: PacketPool::default(),
            streams: FxHashMap::default(),
            incoming: FxHashMap::default(),
            last_stream: None,
            orphans: FxHashMap::default(),
            pending_incoming: VecDeque::new(),
            pending_incoming_deadline: None,
            residue: FxHashMap::default(),
            events: VecDeque::new(),
        }
    }

    /// Next thing that happened, if any
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether any stream is live
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Read-only view of a stream, e.g. for metrics
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id.0)
    }

    /// Ids of every live stream
    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.keys().map(|&id| StreamId(id))
    }

    //
    // Inbound
    //

    /// Decompress one data-message payload and dispatch the packet inside
    pub fn handle_data_payload(&mut self, now: Instant, data: &[u8]) {
        let mut packet = self.pool.acquire();
        let mut buf = std::mem::take(&mut packet.buf);
        let inflated = self
            .msg_factory
            .compression
            .inflate(data, &mut buf, self.config.max_packet_size);
        packet.buf = buf;
        match inflated {
            Some(len) if len > 0 => {
                if let Err(err) = self.handle_packet_buf(now, packet) {
                    trace!(%err, "dropping malformed packet");
                }
            }
            _ => {
                warn!("data message did not decompress");
                self.pool.release(packet);
            }
        }
    }

    /// Dispatch one already-decompressed stream packet
    pub fn handle_packet(&mut self, now: Instant, data: &[u8]) -> Result<(), PacketDecodeError> {
        let mut packet = self.pool.acquire();
        packet.buf.extend_from_slice(data);
        self.handle_packet_buf(now, packet)
    }

    fn handle_packet_buf(
        &mut self,
        now: Instant,
        packet: Packet,
    ) -> Result<(), PacketDecodeError> {
        if let Err(err) = Packet::check(&packet.buf) {
            self.pool.release(packet);
            return Err(err);
        }
        let send_stream_id = packet.send_stream_id();
        if send_stream_id != 0 {
            if self.last_stream != Some(send_stream_id)
                || !self.streams.contains_key(&send_stream_id)
            {
                self.last_stream = self
                    .streams
                    .contains_key(&send_stream_id)
                    .then_some(send_stream_id);
            }
            if let Some(recv_id) = self.last_stream {
                let stream = self.streams.get_mut(&recv_id).unwrap();
                stream.handle_packet(now, packet, &mut self.pool);
                self.sweep(recv_id);
            } else if packet.is_echo() && self.config.answer_pings {
                info!(ssid = send_stream_id, "ping received");
                let mut responder = self.throwaway_stream();
                responder.handle_ping(now, packet, &mut self.pool);
            } else {
                info!(ssid = send_stream_id, "unknown stream");
                self.pool.release(packet);
            }
        } else {
            self.handle_unaddressed_packet(now, packet);
        }
        Ok(())
    }

    /// Packets with a zero send stream id: pongs, SYNs, and early follow-ons
    fn handle_unaddressed_packet(&mut self, now: Instant, packet: Packet) {
        if packet.is_echo() {
            info!(rsid = packet.receive_stream_id(), "pong received");
            self.pool.release(packet);
            return;
        }
        let peer_recv_id = packet.receive_stream_id();
        if packet.is_syn() && packet.seqn() == 0 {
            // new incoming stream
            if let Some(&recv_id) = self.incoming.get(&peer_recv_id) {
                // our SYN-ACK was evidently lost; answer over a new path
                warn!(rsid = peer_recv_id, "incoming stream already exists");
                if let Some(stream) = self.streams.get_mut(&recv_id) {
                    stream.reset_routing_path();
                }
                self.pool.release(packet);
                return;
            }
            let recv_id = self.create_incoming_stream(peer_recv_id);
            let stream = self.streams.get_mut(&recv_id).unwrap();
            stream.handle_packet(now, packet, &mut self.pool);

            if let Some(bucket) = self.orphans.remove(&peer_recv_id) {
                debug!(
                    count = bucket.packets.len(),
                    rsid = peer_recv_id,
                    "processing saved packets"
                );
                let stream = self.streams.get_mut(&recv_id).unwrap();
                for saved in bucket.packets {
                    stream.handle_packet(now, saved, &mut self.pool);
                }
            }
            let terminated = self
                .streams
                .get(&recv_id)
                .map_or(true, |stream| stream.is_terminated());
            if terminated {
                // the handshake itself killed it
                self.sweep(recv_id);
                return;
            }
            if self.pending_incoming.len() < self.config.max_pending_incoming {
                self.pending_incoming.push_back(recv_id);
                self.pending_incoming_deadline =
                    Some(now + self.config.pending_incoming_timeout);
                self.events.push_back(Event::IncomingStream(StreamId(recv_id)));
                self.sweep(recv_id);
                debug!(rsid = peer_recv_id, "pending incoming stream added");
            } else {
                warn!(
                    backlog = self.pending_incoming.len(),
                    "pending incoming streams backlog exceeded"
                );
                let stream = self.streams.get_mut(&recv_id).unwrap();
                stream.close(now, &mut self.pool);
                self.sweep(recv_id);
            }
        } else {
            // follow-on without its SYN
            if let Some(&recv_id) = self.incoming.get(&peer_recv_id) {
                let stream = self.streams.get_mut(&recv_id).unwrap();
                stream.handle_packet(now, packet, &mut self.pool);
                self.sweep(recv_id);
                return;
            }
            let deadline = now + self.config.pending_incoming_timeout;
            self.orphans
                .entry(peer_recv_id)
                .or_insert_with(|| OrphanBucket {
                    packets: Vec::new(),
                    deadline,
                })
                .packets
                .push(packet);
        }
    }

    fn throwaway_stream(&mut self) -> Stream {
        let rng = StdRng::from_rng(&mut self.rng).unwrap();
        Stream::new_incoming(
            self.config.clone(),
            self.local.clone(),
            self.msg_factory.clone(),
            rng,
            self.next_recv_stream_id(),
        )
    }

    fn next_recv_stream_id(&mut self) -> u32 {
        loop {
            let id = self.rng.next_u32();
            if id != 0 && !self.streams.contains_key(&id) {
                return id;
            }
        }
    }

    fn create_incoming_stream(&mut self, peer_recv_id: u32) -> u32 {
        let recv_id = self.next_recv_stream_id();
        let rng = StdRng::from_rng(&mut self.rng).unwrap();
        let stream = Stream::new_incoming(
            self.config.clone(),
            self.local.clone(),
            self.msg_factory.clone(),
            rng,
            recv_id,
        );
        self.streams.insert(recv_id, stream);
        self.incoming.insert(peer_recv_id, recv_id);
        recv_id
    }

    //
    // Outbound and per-stream entry points
    //

    /// Open a stream toward `remote`'s destination port `port`
    ///
    /// The handshake goes out with the first write.
    pub fn create_outgoing_stream(&mut self, remote: Arc<dyn LeaseSet>, port: u16) -> StreamId {
        let recv_id = self.next_recv_stream_id();
        let rng = StdRng::from_rng(&mut self.rng).unwrap();
        let stream = Stream::new_outgoing(
            self.config.clone(),
            self.local.clone(),
            self.msg_factory.clone(),
            rng,
            recv_id,
            remote,
            port,
        );
        self.streams.insert(recv_id, stream);
        StreamId(recv_id)
    }

    /// Fire a signed echo request at `remote`
    pub fn send_ping(&mut self, now: Instant, remote: Arc<dyn LeaseSet>) {
        let rng = StdRng::from_rng(&mut self.rng).unwrap();
        let mut stream = Stream::new_outgoing(
            self.config.clone(),
            self.local.clone(),
            self.msg_factory.clone(),
            rng,
            self.next_recv_stream_id(),
            remote,
            0,
        );
        stream.send_ping(now);
    }

    /// Queue data on a stream; the callback fires when the bytes have been
    /// packetized or the stream dies
    pub fn write(
        &mut self,
        id: StreamId,
        now: Instant,
        data: Bytes,
        on_complete: Option<SendCallback>,
    ) -> Result<(), WriteError> {
        let Some(stream) = self.streams.get_mut(&id.0) else {
            if let Some(callback) = on_complete {
                callback(Err(WriteError::Closed));
            }
            return Err(WriteError::Closed);
        };
        match stream.status() {
            StreamStatus::New | StreamStatus::Open => {
                stream.write(now, data, on_complete, &mut self.pool);
                self.sweep(id.0);
                Ok(())
            }
            _ => {
                if let Some(callback) = on_complete {
                    callback(Err(WriteError::Closed));
                }
                Err(WriteError::Closed)
            }
        }
    }

    /// Read in-order bytes; `None` once the stream is gone and drained
    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Option<usize> {
        if let Some(stream) = self.streams.get_mut(&id.0) {
            return Some(stream.read(buf, &mut self.pool));
        }
        // data the stream delivered in order but nobody read before it died
        let data = self.residue.get_mut(&id.0)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        data.drain(..n);
        if data.is_empty() {
            self.residue.remove(&id.0);
        }
        Some(n)
    }

    /// Drop any salvaged unread data for `id`
    pub fn discard(&mut self, id: StreamId) {
        self.residue.remove(&id.0);
    }

    /// Begin a graceful close
    pub fn close(&mut self, id: StreamId, now: Instant) {
        if let Some(stream) = self.streams.get_mut(&id.0) {
            stream.close(now, &mut self.pool);
            self.sweep(id.0);
        }
    }

    /// Drop a stream immediately, cancelling timers and pending sends
    pub fn terminate(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id.0) {
            stream.terminate(&mut self.pool);
            self.sweep(id.0);
        }
    }

    /// Try to close gracefully, then remove; `false` if the id is unknown
    pub fn delete_stream(&mut self, id: StreamId, now: Instant) -> bool {
        let Some(stream) = self.streams.get_mut(&id.0) else {
            return false;
        };
        stream.close(now, &mut self.pool);
        if let Some(stream) = self.streams.get_mut(&id.0) {
            stream.terminate(&mut self.pool);
        }
        self.sweep(id.0);
        true
    }

    /// Oldest unclaimed incoming stream, if any
    pub fn accept(&mut self) -> Option<StreamId> {
        while let Some(recv_id) = self.pending_incoming.pop_front() {
            if self.pending_incoming.is_empty() {
                self.pending_incoming_deadline = None;
            }
            if self.streams.contains_key(&recv_id) {
                return Some(StreamId(recv_id));
            }
        }
        None
    }

    /// Number of unclaimed incoming streams
    pub fn pending_incoming(&self) -> usize {
        self.pending_incoming.len()
    }

    /// Re-announce our leaseset to every peer after it changed, or re-path
    /// sessions whose announcement went unconfirmed
    pub fn send_updated_lease_set(&mut self, now: Instant) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for recv_id in ids {
            if let Some(stream) = self.streams.get_mut(&recv_id) {
                if stream.status() == StreamStatus::Open {
                    stream.send_updated_lease_set(now);
                    self.sweep(recv_id);
                }
            }
        }
    }

    /// Terminate everything and drop all held buffers
    pub fn stop(&mut self) {
        self.pending_incoming.clear();
        self.pending_incoming_deadline = None;
        for (_, mut stream) in self.streams.drain() {
            stream.terminate(&mut self.pool);
        }
        self.incoming.clear();
        self.last_stream = None;
        for (_, bucket) in self.orphans.drain() {
            for packet in bucket.packets {
                self.pool.release(packet);
            }
        }
        self.residue.clear();
        self.pool.clear();
        self.events.clear();
    }

    //
    // Timers
    //

    /// Nearest deadline across every stream, orphan bucket, and the
    /// pending-accept backlog
    pub fn next_timeout(&mut self) -> Option<Instant> {
        let mut next: Option<Instant> = self.pending_incoming_deadline;
        for stream in self.streams.values_mut() {
            next = min_opt(next, stream.next_timeout());
        }
        for bucket in self.orphans.values() {
            next = min_opt(next, Some(bucket.deadline));
        }
        next
    }

    /// Fire everything due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for recv_id in ids {
            if let Some(stream) = self.streams.get_mut(&recv_id) {
                stream.handle_timeout(now, &mut self.pool);
                self.sweep(recv_id);
            }
        }

        let expired: Vec<u32> = self
            .orphans
            .iter()
            .filter(|(_, bucket)| bucket.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            let bucket = self.orphans.remove(&id).unwrap();
            debug!(rsid = id, count = bucket.packets.len(), "dropping orphan packets");
            for packet in bucket.packets {
                self.pool.release(packet);
            }
        }

        if self.pending_incoming_deadline.is_some_and(|t| t <= now) {
            warn!("pending incoming timeout expired");
            self.pending_incoming_deadline = None;
            let pending: Vec<u32> = self.pending_incoming.drain(..).collect();
            for recv_id in pending {
                if let Some(stream) = self.streams.get_mut(&recv_id) {
                    stream.close(now, &mut self.pool);
                    self.sweep(recv_id);
                }
            }
        }
    }

    /// Collect a stream's events and drop it from the tables once terminated
    fn sweep(&mut self, recv_id: u32) {
        let Some(stream) = self.streams.get_mut(&recv_id) else {
            return;
        };
        let id = StreamId(recv_id);
        let events: Vec<StreamEvent> = stream.take_events().collect();
        let terminated = stream.is_terminated();
        for event in events {
            self.events.push_back(Event::Stream(id, event));
        }
        if terminated {
            let mut stream = self.streams.remove(&recv_id).unwrap();
            let unread = stream.take_unread(&mut self.pool);
            if !unread.is_empty() {
                self.residue.insert(recv_id, unread);
            }
            let send_id = stream.send_stream_id().0;
            self.incoming.remove(&send_id);
            if self.last_stream == Some(recv_id) {
                self.last_stream = None;
            }
            self.pending_incoming.retain(|&x| x != recv_id);
            if self.streams.is_empty() {
                self.pool.clear();
            }
        }
    }
}

fn min_opt(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
