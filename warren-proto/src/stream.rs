//! Per-stream state machine.
//!
//! One [`Stream`] owns everything about a single reliable byte stream:
//! sequence and acknowledgement state, the congestion controller (a hybrid of
//! delay-based and loss-based window management with packet pacing), the
//! retransmission machinery, and the current routing path (outbound tunnel +
//! remote lease). The owning [`Destination`] routes inbound packets here and
//! relays timer expirations; the stream itself pushes fully-built packets out
//! through the substrate traits.
//!
//! [`Destination`]: crate::destination::Destination

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, error, trace, warn};

use crate::config::StreamingConfig;
use crate::destination::DataMessageFactory;
use crate::identity::{Identity, OfflineSignature, Verifier};
use crate::packet::{Flags, Packet, PacketPool, SYN_DEST_HASH_NACKS};
use crate::send_buffer::{SendBufferQueue, SendCallback};
use crate::shared::StreamEvent;
use crate::timer::{Timer, TimerTable};
use crate::tunnel::{
    non_expired_leases, DeliveryType, Lease, LeaseSet, LocalDestination, OutboundTunnel,
    RoutingSession, SharedRoutingPath, TunnelMessageBlock,
};
use crate::StreamId;

/// Lifecycle of a stream
///
/// `Terminated` is absorbing: all timers are cancelled on entry and no
/// callback fires afterwards. A `Reset` stream reaches `Terminated` once
/// close processing completes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamStatus {
    /// Created; nothing sent yet
    New,
    /// Handshake packet emitted or received
    Open,
    /// Close requested; draining the send side
    Closing,
    /// Our FIN is out (or the peer's arrived)
    Closed,
    /// Abortive teardown: peer reset, or retransmission exhausted
    Reset,
    /// Removed from the destination's tables
    Terminated,
}

/// State for one reliable, ordered, bidirectional byte stream
pub struct Stream {
    config: Arc<StreamingConfig>,
    local: Arc<dyn LocalDestination>,
    msg_factory: Arc<DataMessageFactory>,
    rng: StdRng,

    recv_stream_id: u32,
    send_stream_id: u32,
    sequence_number: u32,
    /// First sequence number sent after the path last changed; RTT samples
    /// from packets at or before it are discarded
    tunnels_change_seqn: u32,
    last_received_seqn: Option<u32>,
    previous_received_seqn: Option<u32>,
    status: StreamStatus,

    is_nacked: bool,
    is_send_time: bool,
    is_win_dropped: bool,
    is_timeout_resend: bool,

    remote_leaseset: Option<Arc<dyn LeaseSet>>,
    remote_identity: Option<Identity>,
    transient_verifier: Option<Verifier>,
    routing_session: Option<Arc<dyn RoutingSession>>,
    current_outbound_tunnel: Option<Arc<dyn OutboundTunnel>>,
    current_remote_lease: Option<Lease>,

    send_queue: SendBufferQueue,
    /// Transmitted and neither acknowledged nor abandoned, keyed by sequence
    sent_packets: BTreeMap<u32, Packet>,
    /// Received ahead of sequence, keyed by sequence
    saved_packets: BTreeMap<u32, Packet>,
    /// In-order packets awaiting a user read
    receive_queue: VecDeque<Packet>,

    timers: TimerTable,
    events: VecDeque<StreamEvent>,

    port: u16,
    remote_max_packet_size: Option<u16>,

    /// Smoothed RTT in milliseconds
    rtt: f64,
    prev_rtt_sample: f64,
    /// Threshold the next smoothed RTT is compared against for the
    /// delay-based window drop
    prev_rtt: f64,
    jitter: f64,
    window_size: u32,
    rto: Duration,
    pacing_time: Duration,
    min_pacing_time: Option<Duration>,
    num_resend_attempts: u32,
    mtu: usize,

    num_sent_bytes: u64,
    num_received_bytes: u64,
}

impl Stream {
    /// Stream we are initiating toward `remote`
    pub(crate) fn new_outgoing(
        config: Arc<StreamingConfig>,
        local: Arc<dyn LocalDestination>,
        msg_factory: Arc<DataMessageFactory>,
        rng: StdRng,
        recv_stream_id: u32,
        remote: Arc<dyn LeaseSet>,
        port: u16,
    ) -> Self {
        let remote_identity = Some(remote.identity().clone());
        let mut stream = Self::new_raw(config, local, msg_factory, rng, recv_stream_id, port);
        stream.remote_leaseset = Some(remote);
        stream.remote_identity = remote_identity;
        stream
    }

    /// Stream created for an inbound SYN (or a throw-away ping responder)
    pub(crate) fn new_incoming(
        config: Arc<StreamingConfig>,
        local: Arc<dyn LocalDestination>,
        msg_factory: Arc<DataMessageFactory>,
        rng: StdRng,
        recv_stream_id: u32,
    ) -> Self {
        Self::new_raw(config, local, msg_factory, rng, recv_stream_id, 0)
    }

    fn new_raw(
        config: Arc<StreamingConfig>,
        local: Arc<dyn LocalDestination>,
        msg_factory: Arc<DataMessageFactory>,
        rng: StdRng,
        recv_stream_id: u32,
        port: u16,
    ) -> Self {
        let rtt = config.initial_rtt.as_secs_f64() * 1_000.0;
        let window_size = config.initial_window_size;
        let rto = config.initial_rto;
        let pacing_time = config.initial_pacing_time;
        let min_pacing_time = config.min_pacing_time();
        let mtu = config.mtu;
        Self {
            config,
            local,
            msg_factory,
            rng,
            recv_stream_id,
            send_stream_id: 0,
            sequence_number: 0,
            tunnels_change_seqn: 0,
            last_received_seqn: None,
            previous_received_seqn: None,
            status: StreamStatus::New,
            is_nacked: false,
            is_send_time: true,
            is_win_dropped: true,
            is_timeout_resend: false,
            remote_leaseset: None,
            remote_identity: None,
            transient_verifier: None,
            routing_session: None,
            current_outbound_tunnel: None,
            current_remote_lease: None,
            send_queue: SendBufferQueue::default(),
            sent_packets: BTreeMap::new(),
            saved_packets: BTreeMap::new(),
            receive_queue: VecDeque::new(),
            timers: TimerTable::default(),
            events: VecDeque::new(),
            port,
            remote_max_packet_size: None,
            rtt,
            prev_rtt_sample: rtt,
            prev_rtt: rtt,
            jitter: 0.0,
            window_size,
            rto,
            pacing_time,
            min_pacing_time,
            num_resend_attempts: 0,
            mtu,
            num_sent_bytes: 0,
            num_received_bytes: 0,
        }
    }

    /// Our stream id: the one the peer addresses us by
    pub fn recv_stream_id(&self) -> StreamId {
        StreamId(self.recv_stream_id)
    }

    /// The peer's stream id, zero until its first packet arrives
    pub fn send_stream_id(&self) -> StreamId {
        StreamId(self.send_stream_id)
    }

    /// Current lifecycle state
    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Identity of the peer, once known
    pub fn remote_identity(&self) -> Option<&Identity> {
        self.remote_identity.as_ref()
    }

    /// Payload bytes handed to the substrate so far
    pub fn bytes_sent(&self) -> u64 {
        self.num_sent_bytes
    }

    /// Payload bytes accepted from the substrate so far
    pub fn bytes_received(&self) -> u64 {
        self.num_received_bytes
    }

    /// Whether a read can currently make progress
    pub fn is_readable(&self) -> bool {
        !self.receive_queue.is_empty()
    }

    /// Whether the handshake has completed in both directions
    pub fn is_established(&self) -> bool {
        self.send_stream_id != 0
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.status == StreamStatus::Terminated
    }

    pub(crate) fn take_events(&mut self) -> impl Iterator<Item = StreamEvent> + '_ {
        self.events.drain(..)
    }

    //
    // Receive path
    //

    /// Process one inbound packet addressed to this stream
    pub(crate) fn handle_packet(&mut self, now: Instant, packet: Packet, pool: &mut PacketPool) {
        if self.status == StreamStatus::Terminated {
            pool.release(packet);
            return;
        }
        self.num_received_bytes += packet.len() as u64;
        if self.send_stream_id == 0 {
            self.send_stream_id = packet.receive_stream_id();
            if self.remote_identity.is_none() && packet.nack_count() == SYN_DEST_HASH_NACKS {
                // first packet of an incoming stream: the NACK bytes carry the
                // hash of the destination the sender meant to reach
                let local_hash = *self.local.private_keys().identity().hash();
                if packet.nacks_bytes() != &local_hash.0[..] {
                    warn!(
                        dest = %local_hash,
                        "destination mismatch, dropping misrouted packet"
                    );
                    pool.release(packet);
                    self.terminate(pool);
                    return;
                }
            }
            self.events.push_back(StreamEvent::Opened);
        }

        if !packet.is_no_ack() {
            self.process_ack(now, &packet, pool);
            if self.status == StreamStatus::Terminated {
                pool.release(packet);
                return;
            }
        }

        if packet.is_plain_ack() {
            trace!("plain ACK received");
            pool.release(packet);
            return;
        }

        let received_seqn = packet.seqn();
        let next_expected = self.last_received_seqn.map_or(0, |s| s.wrapping_add(1));
        trace!(seqn = received_seqn, ssid = self.send_stream_id, "received");
        if received_seqn == next_expected {
            let was_syn = packet.is_syn();
            self.process_packet(now, packet, pool);
            if self.status == StreamStatus::Terminated {
                return;
            }

            // drain stored packets now contiguous with the new tail
            while let Some(&seqn) = self.saved_packets.keys().next() {
                if Some(seqn) != self.last_received_seqn.map(|s| s.wrapping_add(1)) {
                    break;
                }
                let saved = self.saved_packets.remove(&seqn).unwrap();
                self.process_packet(now, saved, pool);
                if self.status == StreamStatus::Terminated {
                    return;
                }
            }

            if self.status == StreamStatus::Open {
                if !self.timers.is_set(Timer::Ack) {
                    let ack_timeout = Duration::from_secs_f64(self.rtt / 10_000.0)
                        .min(self.config.ack_delay);
                    self.schedule_ack(now, ack_timeout);
                }
            } else if was_syn && self.status == StreamStatus::New {
                // an incoming stream answers the SYN with its own handshake
                self.send_buffered(now, pool);
            }
        } else if self.last_received_seqn.is_some()
            && received_seqn <= self.last_received_seqn.unwrap()
        {
            warn!(seqn = received_seqn, ssid = self.send_stream_id, "duplicate message");
            let repeat = self
                .previous_received_seqn
                .is_some_and(|prev| received_seqn <= prev)
                || Some(received_seqn) == self.last_received_seqn;
            if repeat {
                // the peer keeps resending: our ACKs are not getting through,
                // force the reply onto a different path
                self.rotate_outbound_tunnel();
                self.update_current_remote_lease(now, false);
            }
            self.previous_received_seqn = Some(received_seqn);
            self.send_quick_ack(now);
            pool.release(packet);
        } else {
            warn!(
                from = next_expected,
                to = received_seqn.wrapping_sub(1),
                ssid = self.send_stream_id,
                "missing messages"
            );
            self.save_packet(packet, pool);
            if self.last_received_seqn.is_some() {
                if !self.timers.is_set(Timer::Ack) {
                    // NACK the holes
                    let ack_timeout = (self.config.min_send_ack_timeout
                        * self.saved_packets.len() as u32)
                        .min(self.config.ack_delay);
                    self.schedule_ack(now, ack_timeout);
                }
            } else {
                // follow-on before the SYN itself
                self.schedule_ack(now, self.config.syn_timeout);
            }
        }
    }

    fn save_packet(&mut self, packet: Packet, pool: &mut PacketPool) {
        let seqn = packet.seqn();
        if self.saved_packets.contains_key(&seqn) {
            pool.release(packet);
        } else {
            self.saved_packets.insert(seqn, packet);
        }
    }

    /// Handle the packet that is next in sequence
    fn process_packet(&mut self, now: Instant, mut packet: Packet, pool: &mut PacketPool) {
        let received_seqn = packet.seqn();
        trace!(seqn = received_seqn, flags = %packet.flags(), "processing");

        let flags = match self.process_options(now, &mut packet, pool) {
            Ok(flags) => flags,
            Err(()) => {
                pool.release(packet);
                self.terminate(pool);
                return;
            }
        };

        packet.offset = packet.payload_offset();
        if packet.len() > 0 {
            self.receive_queue.push_back(packet);
            self.events.push_back(StreamEvent::Readable);
        } else {
            pool.release(packet);
        }

        self.last_received_seqn = Some(received_seqn);

        if flags.contains(Flags::RESET) {
            debug!(
                ssid = self.send_stream_id,
                rsid = self.recv_stream_id,
                seqn = received_seqn,
                "reset flag received"
            );
            self.status = StreamStatus::Reset;
            self.events.push_back(StreamEvent::Reset);
            self.close(now, pool);
        } else if flags.contains(Flags::CLOSE) {
            if self.status != StreamStatus::Closed {
                self.send_close(now, pool);
            }
            self.status = StreamStatus::Closed;
            self.events.push_back(StreamEvent::Finished);
            self.terminate(pool);
        }
    }

    /// Walk the options region
    ///
    /// Returns the effective flags: a failed signature initiates close and
    /// reports CLOSE to the caller. An unusable options region (unsupported
    /// signer, oversized signature, truncation) is an `Err` and kills the
    /// stream.
    fn process_options(
        &mut self,
        now: Instant,
        packet: &mut Packet,
        pool: &mut PacketPool,
    ) -> Result<Flags, ()> {
        let mut flags = packet.flags();
        let options_offset = packet.options_offset();
        let options_size = packet.options_size();
        let mut pos = 0usize;

        let take = |pos: &mut usize, n: usize| -> Result<usize, ()> {
            if *pos + n > options_size {
                return Err(());
            }
            let at = options_offset + *pos;
            *pos += n;
            Ok(at)
        };

        if flags.contains(Flags::DELAY_REQUESTED) {
            let at = take(&mut pos, 2)?;
            let delay = u16::from_be_bytes(packet.buf[at..at + 2].try_into().unwrap());
            if !self.timers.is_set(Timer::Ack) {
                if delay > 0 && f64::from(delay) < self.rtt {
                    self.schedule_ack(now, Duration::from_millis(u64::from(delay)));
                }
                if delay >= self.config.delay_choking {
                    debug!(ssid = self.send_stream_id, "peer requested choking");
                    self.window_size = 1;
                    self.update_pacing_time();
                }
            }
        }

        if flags.contains(Flags::FROM_INCLUDED) {
            if let Some(leaseset) = &self.remote_leaseset {
                self.remote_identity = Some(leaseset.identity().clone());
            }
            let remaining = options_size - pos;
            let at = options_offset + pos;
            match Identity::parse(&packet.buf[at..at + remaining]) {
                Ok((identity, consumed)) => {
                    pos += consumed;
                    if self.remote_identity.is_none() {
                        debug!(
                            from = %identity.hash(),
                            ssid = self.send_stream_id,
                            rsid = self.recv_stream_id,
                            "incoming stream"
                        );
                        self.remote_identity = Some(identity);
                    }
                }
                Err(err) => {
                    debug!(%err, "rejecting stream, sender identity unusable");
                    return Err(());
                }
            }
        }

        if flags.contains(Flags::MAX_PACKET_SIZE_INCLUDED) {
            let at = take(&mut pos, 2)?;
            let max_packet_size = u16::from_be_bytes(packet.buf[at..at + 2].try_into().unwrap());
            trace!(max_packet_size, "peer max packet size");
            self.remote_max_packet_size = Some(max_packet_size);
        }

        if flags.contains(Flags::OFFLINE_SIGNATURE) {
            let Some(identity) = self.remote_identity.clone() else {
                debug!("offline signature without identity");
                return Err(());
            };
            // prefer the transient verifier the leaseset already vouches for
            if self.transient_verifier.is_none() {
                self.transient_verifier = self
                    .remote_leaseset
                    .as_ref()
                    .and_then(|ls| ls.transient_verifier());
            }
            if let Some(verifier) = &self.transient_verifier {
                // already have the key, just step over the block
                let skip = 6 + verifier.public_key_len() + identity.signature_len();
                take(&mut pos, skip)?;
            } else {
                let remaining = options_size - pos;
                let at = options_offset + pos;
                let unix_secs = self.local.unix_time().as_secs();
                match OfflineSignature::parse(&identity, &packet.buf[at..at + remaining], unix_secs)
                {
                    Ok((offline, consumed)) => {
                        pos += consumed;
                        self.transient_verifier = Some(offline.verifier().clone());
                    }
                    Err(err) => {
                        error!(%err, "offline signature rejected");
                        return Err(());
                    }
                }
            }
        }

        if flags.contains(Flags::SIGNATURE_INCLUDED) {
            let signature_len = match (&self.transient_verifier, &self.remote_identity) {
                (Some(verifier), _) => verifier.signature_len(),
                (None, Some(identity)) => identity.signature_len(),
                (None, None) => {
                    debug!("signature without identity");
                    return Err(());
                }
            };
            if signature_len > 256 {
                error!(signature_len, "signature too big");
                return Err(());
            }
            let at = take(&mut pos, signature_len)?;
            let mut signature = [0u8; 256];
            signature[..signature_len].copy_from_slice(&packet.buf[at..at + signature_len]);
            packet.buf[at..at + signature_len].fill(0);
            let verified = match (&self.transient_verifier, &self.remote_identity) {
                (Some(verifier), _) => verifier.verify(&packet.buf, &signature[..signature_len]),
                (None, Some(identity)) => {
                    identity.verify(&packet.buf, &signature[..signature_len])
                }
                (None, None) => unreachable!(),
            };
            packet.buf[at..at + signature_len].copy_from_slice(&signature[..signature_len]);
            if !verified {
                error!(
                    ssid = self.send_stream_id,
                    rsid = self.recv_stream_id,
                    "signature verification failed"
                );
                self.close(now, pool);
                flags |= Flags::CLOSE;
            }
        }

        Ok(flags)
    }

    //
    // Acknowledgement processing
    //

    fn process_ack(&mut self, now: Instant, packet: &Packet, pool: &mut PacketPool) {
        let mut acknowledged = false;
        let ack_through = packet.ack_through();
        if ack_through > self.sequence_number {
            error!(
                ack_through,
                seqn = self.sequence_number,
                "unexpected ackThrough"
            );
            return;
        }
        let nacks: Vec<u32> = (0..packet.nack_count() as usize)
            .map(|i| packet.nack(i))
            .collect();

        // a choking quick-ack carries a stale sequence number and would be
        // dropped as a duplicate before its options are parsed, so honor the
        // choke request here, where every acknowledgement passes through
        if packet.flags().contains(Flags::DELAY_REQUESTED) && packet.options_size() >= 2 {
            let at = packet.options_offset();
            let delay = u16::from_be_bytes(packet.buf[at..at + 2].try_into().unwrap());
            if delay >= self.config.delay_choking {
                debug!(ssid = self.send_stream_id, "peer requested choking");
                self.window_size = 1;
                self.update_pacing_time();
            }
        }

        let mut rtt_sample = f64::INFINITY;
        let mut first_rtt_sample = false;
        self.is_nacked = false;
        let acked: Vec<u32> = self
            .sent_packets
            .range(..=ack_through)
            .map(|(&seqn, _)| seqn)
            .collect();
        for seqn in acked {
            if nacks.contains(&seqn) {
                trace!(seqn, "packet NACKed");
                self.is_nacked = true;
                continue;
            }
            let sent = self.sent_packets.remove(&seqn).unwrap();
            let rtt = sent
                .send_time
                .map_or(Duration::ZERO, |t| now.saturating_duration_since(t))
                .as_secs_f64()
                * 1_000.0;
            if seqn == 0 {
                first_rtt_sample = true;
                rtt_sample = rtt.max(1.0);
            } else if !sent.resent && seqn > self.tunnels_change_seqn {
                rtt_sample = rtt_sample.min(rtt);
            }
            trace!(seqn, rtt, "packet acknowledged");
            acknowledged = true;
            if self.window_size < self.config.max_window_size {
                self.window_size += 1;
            }
        }

        if rtt_sample.is_finite() {
            let alpha = self.config.rtt_ewma_alpha;
            if first_rtt_sample {
                self.rtt = rtt_sample;
                self.prev_rtt_sample = rtt_sample;
            } else {
                self.rtt = alpha * rtt_sample + (1.0 - alpha) * self.rtt;
            }
            let jitter_new = if rtt_sample != self.prev_rtt_sample {
                (rtt_sample - self.prev_rtt_sample).abs()
            } else {
                (rtt_sample / 10.0).round()
            };
            self.jitter = (alpha * self.jitter + (1.0 - alpha) * jitter_new).round();
            self.prev_rtt_sample = rtt_sample;

            // delay-based congestion control: a growing smoothed RTT means
            // queues are building somewhere along the path
            if self.rtt > self.prev_rtt && !self.is_win_dropped {
                self.window_size >>= 1;
                self.is_win_dropped = true;
            }
            if self.window_size < self.config.min_window_size {
                self.window_size = self.config.min_window_size;
            }
            self.update_pacing_time();
            self.prev_rtt = self.rtt * 1.1 + self.jitter;

            let was_initial = self.rto == self.config.initial_rto;
            self.rto = Duration::from_millis((self.rtt * 1.3 + self.jitter) as u64)
                .max(self.config.min_rto);
            if was_initial {
                self.schedule_resend(now);
            }
        }

        if self.window_size as usize > self.sent_packets.len() {
            self.is_win_dropped = false;
        }
        if acknowledged || self.is_nacked {
            self.schedule_resend(now);
        }
        if (self.send_queue.is_empty() && !self.sent_packets.is_empty())
            || self.sent_packets.len() > self.window_size as usize
        {
            // tail loss, or the window was dropped below what is in flight
            self.is_nacked = true;
        }
        if first_rtt_sample {
            if let (Some(session), Some(tunnel), Some(lease)) = (
                &self.routing_session,
                &self.current_outbound_tunnel,
                &self.current_remote_lease,
            ) {
                session.set_shared_routing_path(Some(SharedRoutingPath {
                    outbound_tunnel: tunnel.clone(),
                    remote_lease: lease.clone(),
                    rtt: Duration::from_secs_f64(self.rtt / 1_000.0),
                }));
            }
        }
        if self.sent_packets.is_empty() && self.send_queue.is_empty() {
            self.timers.stop(Timer::Resend);
            self.timers.stop(Timer::Pacing);
        }
        if acknowledged {
            self.num_resend_attempts = 0;
            self.events.push_back(StreamEvent::Writable);
            self.send_buffered(now, pool);
        }
        match self.status {
            StreamStatus::Closed => self.terminate(pool),
            StreamStatus::Closing => self.close(now, pool),
            _ => {}
        }
    }

    //
    // Send path
    //

    /// Queue `data` and try to transmit under the current window and pacing
    pub(crate) fn write(
        &mut self,
        now: Instant,
        data: Bytes,
        on_complete: Option<SendCallback>,
        pool: &mut PacketPool,
    ) {
        if !data.is_empty() {
            self.send_queue.add(data, on_complete);
        } else if let Some(callback) = on_complete {
            callback(Ok(()));
        }
        self.send_buffered(now, pool);
    }

    /// Bytes currently queued but not yet packetized
    pub fn queued_bytes(&self) -> usize {
        self.send_queue.size()
    }

    /// Move queued data into packets, bounded by the window and pacing tick
    fn send_buffered(&mut self, now: Instant, pool: &mut PacketPool) {
        if self.status == StreamStatus::New
            || !self.send_queue.is_empty()
            || !self.sent_packets.is_empty()
        {
            self.schedule_send(now);
        }
        if self.window_size as usize <= self.sent_packets.len() || !self.is_send_time {
            return;
        }
        // one packet per pacing tick
        let mut num_msgs = 1;
        let is_no_ack = self.last_received_seqn.is_none();
        let mut built: Vec<u32> = Vec::new();
        while self.status == StreamStatus::New
            || (self.is_established() && !self.send_queue.is_empty() && num_msgs > 0)
        {
            let mut packet = pool.acquire();
            let buf = &mut packet.buf;
            buf.put_u32(self.send_stream_id);
            buf.put_u32(self.recv_stream_id);
            let seqn = self.sequence_number;
            self.sequence_number = self.sequence_number.wrapping_add(1);
            buf.put_u32(seqn);
            buf.put_u32(if is_no_ack {
                0
            } else {
                self.last_received_seqn.unwrap_or(0)
            });
            if self.status == StreamStatus::New && self.send_stream_id == 0 {
                if let Some(identity) = &self.remote_identity {
                    // SYN: the NACK field carries the hash of the destination
                    // we mean to reach
                    buf.put_u8(SYN_DEST_HASH_NACKS);
                    buf.put_slice(identity.hash().as_bytes());
                } else {
                    buf.put_u8(0);
                }
            } else {
                buf.put_u8(0);
            }
            buf.put_u8((self.rto.as_millis() / 1_000).min(255) as u8); // resend delay, seconds

            if self.status == StreamStatus::New {
                self.status = StreamStatus::Open;
                if self.remote_leaseset.is_none() {
                    if let Some(identity) = &self.remote_identity {
                        self.remote_leaseset = self.local.find_leaseset(identity.hash());
                    }
                }
                if let Some(leaseset) = &self.remote_leaseset {
                    self.routing_session = self.local.routing_session(leaseset);
                    if let Some(session) = &self.routing_session {
                        self.mtu = if session.is_ratchets() {
                            self.config.mtu_ratchets
                        } else {
                            self.config.mtu
                        };
                    }
                }
                let keys = self.local.private_keys();
                let mut flags = Flags::SYNCHRONIZE
                    | Flags::FROM_INCLUDED
                    | Flags::SIGNATURE_INCLUDED
                    | Flags::MAX_PACKET_SIZE_INCLUDED;
                if is_no_ack {
                    flags |= Flags::NO_ACK;
                }
                if keys.is_offline_signature() {
                    flags |= Flags::OFFLINE_SIGNATURE;
                }
                buf.put_u16(flags.0);
                let options_size_at = buf.len();
                buf.put_u16(0); // patched below
                let identity = keys.identity();
                let mut serialized = Vec::with_capacity(identity.serialized_len());
                identity.write_to(&mut serialized);
                buf.put_slice(&serialized);
                buf.put_u16(self.mtu as u16);
                if let Some(offline) = keys.offline_signature() {
                    buf.put_slice(offline.as_bytes());
                }
                let signature_len = keys.signature_len();
                let signature_at = buf.len();
                buf.resize(buf.len() + signature_len, 0);
                let options_size = (buf.len() - options_size_at - 2) as u16;
                buf[options_size_at..options_size_at + 2]
                    .copy_from_slice(&options_size.to_be_bytes());
                self.drain_payload(&mut packet);
                let signature = self.local.private_keys().sign(&packet.buf);
                packet.buf[signature_at..signature_at + signature_len]
                    .copy_from_slice(&signature);
            } else {
                buf.put_u16(0); // flags
                buf.put_u16(0); // no options
                self.drain_payload(&mut packet);
            }
            built.push(seqn);
            packet.send_time = Some(now);
            self.sent_packets.insert(seqn, packet);
            num_msgs -= 1;
        }
        if !built.is_empty() {
            if self.saved_packets.is_empty() {
                // nothing to NACK; the data packets carry the ACK
                self.timers.stop(Timer::Ack);
            }
            let was_empty = self.sent_packets.len() == built.len();
            let batch: Vec<Bytes> = built
                .iter()
                .map(|seqn| Bytes::copy_from_slice(&self.sent_packets[seqn].buf))
                .collect();
            self.send_packets(now, &batch);
            self.is_send_time = false;
            if self.status == StreamStatus::Closing && self.send_queue.is_empty() {
                self.send_close(now, pool);
            }
            if was_empty {
                self.schedule_resend(now);
            }
        }
    }

    fn drain_payload(&mut self, packet: &mut Packet) {
        let mut out = std::mem::take(&mut packet.buf);
        let drained = self.send_queue.drain_into(&mut out, self.mtu);
        packet.buf = out;
        trace!(bytes = drained, "payload drained");
    }

    /// Immediate acknowledgement of everything known, NACKing the holes
    pub(crate) fn send_quick_ack(&mut self, now: Instant) {
        let mut ack_through = match (self.last_received_seqn, self.saved_packets.keys().last()) {
            (last, Some(&saved)) => match last {
                Some(last) if last > saved => last,
                _ => saved,
            },
            (Some(last), None) => last,
            (None, None) => {
                error!("no packets received yet, nothing to ACK");
                return;
            }
        };

        let mut nacks: Vec<u32> = Vec::new();
        let mut choking = false;
        if Some(ack_through) != self.last_received_seqn {
            let mut next_seqn = self.last_received_seqn.map_or(0, |s| s.wrapping_add(1));
            for &seqn in self.saved_packets.keys() {
                if nacks.len() + (seqn - next_seqn) as usize >= 256 {
                    error!(seqn, next_seqn, "number of NACKs exceeds 255, choking");
                    ack_through = next_seqn.wrapping_sub(1);
                    choking = true;
                    break;
                }
                for missing in next_seqn..seqn {
                    nacks.push(missing);
                }
                next_seqn = seqn.wrapping_add(1);
            }
        }

        let mut buf = Vec::with_capacity(32 + 4 * nacks.len());
        buf.put_u32(self.send_stream_id);
        buf.put_u32(self.recv_stream_id);
        buf.put_u32(0); // plain ACK
        buf.put_u32(ack_through);
        buf.put_u8(nacks.len() as u8);
        for nack in &nacks {
            buf.put_u32(*nack);
        }
        buf.put_u8(0); // resend delay
        if choking {
            buf.put_u16(Flags::DELAY_REQUESTED.0);
            buf.put_u16(2); // options size
            buf.put_u16(self.config.delay_choking);
        } else {
            buf.put_u16(0); // flags
            buf.put_u16(0); // no options
        }
        self.send_packets(now, &[buf.into()]);
        trace!(nacks = nacks.len(), "quick ACK sent");
    }

    /// Signed echo request; the peer answers with a pong carrying the payload
    pub(crate) fn send_ping(&mut self, now: Instant) {
        let keys = self.local.private_keys();
        let mut buf = Vec::new();
        buf.put_u32(self.recv_stream_id);
        buf.put_slice(&[0u8; 14]); // recv id, seqn, ackThrough, NACK count, resend delay
        let mut flags = Flags::ECHO | Flags::SIGNATURE_INCLUDED | Flags::FROM_INCLUDED;
        if keys.is_offline_signature() {
            flags |= Flags::OFFLINE_SIGNATURE;
        }
        buf.put_u16(flags.0);
        let options_size_at = buf.len();
        buf.put_u16(0);
        let identity = keys.identity();
        let mut serialized = Vec::with_capacity(identity.serialized_len());
        identity.write_to(&mut serialized);
        buf.put_slice(&serialized);
        if let Some(offline) = keys.offline_signature() {
            buf.put_slice(offline.as_bytes());
        }
        let signature_len = keys.signature_len();
        let signature_at = buf.len();
        buf.resize(buf.len() + signature_len, 0);
        let options_size = (buf.len() - options_size_at - 2) as u16;
        buf[options_size_at..options_size_at + 2].copy_from_slice(&options_size.to_be_bytes());
        let signature = keys.sign(&buf);
        buf[signature_at..signature_at + signature_len].copy_from_slice(&signature);
        let len = buf.len();
        self.send_packets(now, &[buf.into()]);
        debug!(bytes = len, "ping sent");
    }

    /// Verify a ping and answer it with a pong echoing its payload
    pub(crate) fn handle_ping(&mut self, now: Instant, mut packet: Packet, pool: &mut PacketPool) {
        // a failed signature comes back as a CLOSE flag; no pong for those
        let verified = match self.process_options(now, &mut packet, pool) {
            Ok(flags) => !flags.contains(Flags::CLOSE),
            Err(()) => false,
        };
        if verified && self.remote_identity.is_some() {
            let mut buf = vec![0u8; 22]; // minimal header, all zeroes
            buf[4..8].copy_from_slice(&packet.buf[0..4]); // echo the ping's send id
            buf[18..20].copy_from_slice(&Flags::ECHO.0.to_be_bytes());
            buf.extend_from_slice(packet.payload());
            let len = buf.len();
            self.send_packets(now, &[buf.into()]);
            debug!(bytes = len, "pong sent");
        }
        pool.release(packet);
    }

    //
    // Closing
    //

    /// Drive the close state machine
    pub(crate) fn close(&mut self, now: Instant, pool: &mut PacketPool) {
        debug!(
            ssid = self.send_stream_id,
            rsid = self.recv_stream_id,
            status = ?self.status,
            "closing stream"
        );
        match self.status {
            StreamStatus::Open => {
                self.status = StreamStatus::Closing;
                self.close(now, pool);
                if self.status == StreamStatus::Closing {
                    debug!(ssid = self.send_stream_id, "sending remaining data before close");
                }
            }
            StreamStatus::Closing => {
                if self.sent_packets.is_empty() && self.send_queue.is_empty() {
                    self.status = StreamStatus::Closed;
                    self.send_close(now, pool);
                }
            }
            StreamStatus::Reset => self.terminate(pool),
            StreamStatus::Closed => self.terminate(pool),
            StreamStatus::Terminated => {}
            StreamStatus::New => {
                warn!(
                    ssid = self.send_stream_id,
                    status = ?self.status,
                    "unexpected status on close"
                );
            }
        }
    }

    /// Emit the FIN: a signed, empty CLOSE packet
    fn send_close(&mut self, now: Instant, pool: &mut PacketPool) {
        let mut packet = pool.acquire();
        let buf = &mut packet.buf;
        buf.put_u32(self.send_stream_id);
        buf.put_u32(self.recv_stream_id);
        let seqn = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        buf.put_u32(seqn);
        buf.put_u32(self.last_received_seqn.unwrap_or(0));
        buf.put_u8(0); // NACK count
        buf.put_u8(0); // resend delay
        buf.put_u16((Flags::CLOSE | Flags::SIGNATURE_INCLUDED).0);
        let keys = self.local.private_keys();
        let signature_len = keys.signature_len();
        buf.put_u16(signature_len as u16); // options: signature only
        let signature_at = buf.len();
        buf.resize(buf.len() + signature_len, 0);
        let signature = keys.sign(&packet.buf);
        packet.buf[signature_at..signature_at + signature_len].copy_from_slice(&signature);
        self.send_packet(now, seqn, packet);
        debug!(ssid = self.send_stream_id, "FIN sent");
    }

    /// Transmit one packet outside the pacing path and track it for resend
    fn send_packet(&mut self, now: Instant, seqn: u32, mut packet: Packet) {
        self.timers.stop(Timer::Ack);
        if packet.send_time.is_none() {
            packet.send_time = Some(now);
        }
        let data = Bytes::copy_from_slice(&packet.buf);
        let was_empty = self.sent_packets.is_empty();
        self.sent_packets.insert(seqn, packet);
        self.send_packets(now, &[data]);
        if was_empty {
            self.schedule_resend(now);
        }
    }

    /// Reads up to `buf.len()` in-order bytes; packet boundaries are invisible
    pub(crate) fn read(&mut self, buf: &mut [u8], pool: &mut PacketPool) -> usize {
        let mut pos = 0;
        while pos < buf.len() && !self.receive_queue.is_empty() {
            let packet = self.receive_queue.front_mut().unwrap();
            let n = packet.len().min(buf.len() - pos);
            buf[pos..pos + n].copy_from_slice(&packet.data()[..n]);
            pos += n;
            packet.offset += n;
            if packet.is_empty() {
                let packet = self.receive_queue.pop_front().unwrap();
                pool.release(packet);
            }
        }
        pos
    }

    //
    // Path selection and transmission
    //

    /// Wrap a batch through the routing session and hand it to the current
    /// outbound tunnel, (re)selecting tunnel and lease as needed
    fn send_packets(&mut self, now: Instant, packets: &[Bytes]) {
        if self.remote_leaseset.is_none() {
            self.update_current_remote_lease(now, false);
            if self.remote_leaseset.is_none() {
                error!(
                    ssid = self.send_stream_id,
                    "can't send packets, missing remote leaseset"
                );
                return;
            }
        }
        let needs_session = match &self.routing_session {
            None => true,
            Some(s) => s.is_terminated() || !s.is_ready_to_send(),
        };
        if needs_session {
            let leaseset = self.remote_leaseset.as_ref().unwrap();
            self.routing_session = self.local.routing_session(leaseset);
        }
        if self.current_outbound_tunnel.is_none() {
            if let Some(session) = &self.routing_session {
                // adopt the path another stream to this remote has measured
                if let Some(path) = session.shared_routing_path() {
                    self.current_outbound_tunnel = Some(path.outbound_tunnel);
                    self.current_remote_lease = Some(path.remote_lease);
                    self.rtt = path.rtt.as_secs_f64() * 1_000.0;
                    self.rto = Duration::from_millis((self.rtt * 1.3 + self.jitter) as u64)
                        .max(self.config.min_rto);
                }
            }
        }

        let threshold = self.config.lease_expiration_threshold;
        let lease_stale = match &self.current_remote_lease {
            Some(lease) => now + threshold >= lease.expires,
            None => true,
        };
        if lease_stale {
            self.update_current_remote_lease(now, true);
        }
        let usable = self
            .current_remote_lease
            .as_ref()
            .is_some_and(|lease| now < lease.expires + threshold);
        if !usable {
            warn!(ssid = self.send_stream_id, "remote lease is not available");
            if let Some(session) = &self.routing_session {
                session.set_shared_routing_path(None);
            }
            return;
        }
        let lease = self.current_remote_lease.clone().unwrap();

        let mut fresh_tunnel = false;
        match &self.current_outbound_tunnel {
            None => {
                self.current_outbound_tunnel = self
                    .local
                    .tunnel_pool()
                    .next_outbound_tunnel(None, Some(&lease.tunnel_gateway));
                fresh_tunnel = true;
            }
            Some(tunnel) if !tunnel.is_established() => {
                let (replacement, fresh) =
                    self.local.tunnel_pool().new_outbound_tunnel(tunnel);
                self.current_outbound_tunnel = replacement;
                fresh_tunnel = fresh;
            }
            Some(_) => {}
        }
        let Some(tunnel) = self.current_outbound_tunnel.clone() else {
            error!(ssid = self.send_stream_id, "no outbound tunnels in the pool");
            self.current_remote_lease = None;
            return;
        };
        if fresh_tunnel {
            self.rto = self.config.initial_rto;
            self.tunnels_change_seqn = self.sequence_number;
        }

        let session = match &self.routing_session {
            Some(session) => session.clone(),
            None => {
                error!(ssid = self.send_stream_id, "no routing session");
                return;
            }
        };
        let mut blocks = Vec::with_capacity(packets.len());
        for data in packets {
            let msg = self.msg_factory.create(data, self.port);
            blocks.push(TunnelMessageBlock {
                delivery_type: DeliveryType::Tunnel,
                gateway: lease.tunnel_gateway,
                tunnel_id: lease.tunnel_id,
                message: session.wrap_single_message(msg),
            });
            self.num_sent_bytes += data.len() as u64;
        }
        tunnel.send_tunnel_data(blocks);
    }

    /// Re-announce our leaseset to the peer, or nudge an unconfirmed one
    /// onto a different path
    pub(crate) fn send_updated_lease_set(&mut self, now: Instant) {
        match &self.routing_session {
            Some(session) if !session.is_terminated() => {
                if session.is_leaseset_non_confirmed() {
                    let submitted = session.leaseset_submission_time();
                    let stale = submitted.is_some_and(|t| {
                        now > t + self.config.leaseset_confirmation_timeout
                    });
                    if stale {
                        warn!("leaseset was not confirmed, resubmitting over a new path");
                        session.set_shared_routing_path(None);
                        self.current_outbound_tunnel = None;
                        self.current_remote_lease = None;
                        self.send_quick_ack(now);
                    }
                } else if session.is_leaseset_updated() {
                    debug!("sending updated leaseset");
                    self.send_quick_ack(now);
                }
            }
            _ => self.send_quick_ack(now),
        }
    }

    fn rotate_outbound_tunnel(&mut self) {
        self.current_outbound_tunnel = self.local.tunnel_pool().next_outbound_tunnel(
            self.current_outbound_tunnel.as_ref(),
            self.current_remote_lease
                .as_ref()
                .map(|lease| &lease.tunnel_gateway),
        );
        self.tunnels_change_seqn = self.sequence_number;
    }

    /// Pick (or re-pick) the remote lease; `expired` forces a swap away from
    /// the current one
    fn update_current_remote_lease(&mut self, now: Instant, mut expired: bool) {
        let leaseset_gone = match &self.remote_leaseset {
            Some(leaseset) => leaseset.is_expired(now),
            None => true,
        };
        if leaseset_gone {
            let Some(identity) = self.remote_identity.clone() else {
                self.current_remote_lease = None;
                return;
            };
            match self.local.find_leaseset(identity.hash()) {
                Some(fresh) => {
                    self.transient_verifier = fresh.transient_verifier();
                    self.remote_identity = Some(fresh.identity().clone());
                    self.remote_leaseset = Some(fresh);
                }
                None => {
                    warn!(
                        remote = %identity.hash(),
                        expired = self.remote_leaseset.is_some(),
                        "leaseset not found"
                    );
                    let encrypted = self
                        .remote_leaseset
                        .as_ref()
                        .is_some_and(|ls| ls.is_published_encrypted());
                    self.local.request_destination(identity.hash());
                    if encrypted {
                        // keep the old set around for the next request
                        return;
                    }
                    self.remote_leaseset = None;
                }
            }
        }

        let Some(leaseset) = self.remote_leaseset.clone() else {
            warn!("remote leaseset not found");
            self.current_remote_lease = None;
            return;
        };
        if self.routing_session.is_none() {
            self.routing_session = self.local.routing_session(&leaseset);
        }
        let mut leases = non_expired_leases(leaseset.as_ref(), now, None);
        if leases.is_empty() {
            expired = false;
            // time to request a newer set, then tolerate the threshold
            self.local
                .request_destination(leaseset.identity().hash());
            leases = non_expired_leases(
                leaseset.as_ref(),
                now,
                Some(self.config.lease_expiration_threshold),
            );
        }
        if leases.is_empty() {
            warn!("all remote leases are expired");
            self.remote_leaseset = None;
            self.current_remote_lease = None;
            return;
        }
        if expired {
            if let Some(current) = &self.current_remote_lease {
                // prefer a different tunnel behind the same gateway
                if let Some(swap) = leases.iter().find(|lease| {
                    lease.tunnel_gateway == current.tunnel_gateway
                        && lease.tunnel_id != current.tunnel_id
                }) {
                    self.current_remote_lease = Some(swap.clone());
                    self.tunnels_change_seqn = self.sequence_number;
                    return;
                }
            }
        }
        let mut i = self.rng.gen_range(0..leases.len());
        if let Some(current) = &self.current_remote_lease {
            if leases[i].tunnel_id == current.tunnel_id {
                i = (i + 1) % leases.len();
            }
        }
        self.current_remote_lease = Some(leases[i].clone());
        self.tunnels_change_seqn = self.sequence_number;
    }

    /// Forget the measured path so the next send picks everything afresh
    pub(crate) fn reset_routing_path(&mut self) {
        self.current_outbound_tunnel = None;
        self.current_remote_lease = None;
        self.rtt = self.config.initial_rtt.as_secs_f64() * 1_000.0;
        self.rto = self.config.initial_rto;
        self.tunnels_change_seqn = self.sequence_number;
        if let Some(session) = &self.routing_session {
            session.set_shared_routing_path(None);
        }
    }

    //
    // Timers
    //

    /// Nearest pending deadline
    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        self.timers.peek()
    }

    /// Fire every timer due at `now`
    pub(crate) fn handle_timeout(&mut self, now: Instant, pool: &mut PacketPool) {
        while let Some(timer) = self.timers.expire_before(now) {
            if self.status == StreamStatus::Terminated {
                return;
            }
            match timer {
                Timer::Pacing => self.on_send_timer(now, pool),
                Timer::Resend => self.on_resend_timer(now, pool),
                Timer::Ack => self.on_ack_send_timer(now, pool),
            }
        }
    }

    fn schedule_send(&mut self, now: Instant) {
        if self.status != StreamStatus::Terminated {
            self.timers.set(Timer::Pacing, now + self.pacing_time);
        }
    }

    fn on_send_timer(&mut self, now: Instant, pool: &mut PacketPool) {
        self.is_send_time = true;
        if self.is_nacked {
            // fast retransmit, one packet per tick
            self.resend_packet(now, pool);
        } else if !self.is_win_dropped && self.sent_packets.len() == self.window_size as usize {
            // sending at exactly the window with no losses reported yet:
            // early delay-based detection, symmetric to the ACK-side drop
            self.window_size >>= 1;
            self.is_win_dropped = true;
            if self.window_size < self.config.min_window_size {
                self.window_size = self.config.min_window_size;
            }
            self.update_pacing_time();
            self.schedule_send(now);
        } else if self.window_size as usize > self.sent_packets.len() {
            self.send_buffered(now, pool);
        } else {
            self.schedule_send(now);
        }
    }

    fn schedule_resend(&mut self, now: Instant) {
        if self.status != StreamStatus::Terminated {
            self.timers.set(Timer::Resend, now + self.rto);
        }
    }

    fn on_resend_timer(&mut self, now: Instant, pool: &mut PacketPool) {
        self.is_send_time = true;
        if self.rto > self.config.initial_rto {
            self.rto = self.config.initial_rto;
        }
        // no ACKs within a full RTO: disable fast retransmit for this round
        self.timers.stop(Timer::Pacing);
        self.is_timeout_resend = true;
        self.is_nacked = false;
        self.resend_packet(now, pool);
    }

    fn schedule_ack(&mut self, now: Instant, timeout: Duration) {
        let timeout = timeout.max(self.config.min_send_ack_timeout);
        self.timers.set(Timer::Ack, now + timeout);
    }

    fn on_ack_send_timer(&mut self, now: Instant, pool: &mut PacketPool) {
        if self.last_received_seqn.is_none() {
            warn!(
                rsid = self.recv_stream_id,
                ssid = self.send_stream_id,
                "SYN has not been received after follow-on, terminating"
            );
            self.status = StreamStatus::Reset;
            self.events.push_back(StreamEvent::Reset);
            self.close(now, pool);
            return;
        }
        if self.status == StreamStatus::Open {
            if let Some(session) = &self.routing_session {
                if session.is_leaseset_non_confirmed() {
                    let submitted = session.leaseset_submission_time();
                    let stale = submitted.is_some_and(|t| {
                        now > t + self.config.leaseset_confirmation_timeout
                    });
                    if stale {
                        // something went wrong underneath; re-select the path
                        self.current_outbound_tunnel = None;
                        self.current_remote_lease = None;
                    }
                }
            }
            self.send_quick_ack(now);
        }
    }

    //
    // Retransmission
    //

    fn resend_packet(&mut self, now: Instant, pool: &mut PacketPool) {
        if self.num_resend_attempts >= self.config.max_resend_attempts {
            warn!(
                rsid = self.recv_stream_id,
                ssid = self.send_stream_id,
                attempts = self.num_resend_attempts,
                "packet was not ACKed, terminating"
            );
            self.status = StreamStatus::Reset;
            self.events.push_back(StreamEvent::Reset);
            self.close(now, pool);
            return;
        }

        // at most one timed-out packet per invocation
        let mut resend: Option<Bytes> = None;
        for (_, packet) in self.sent_packets.iter_mut() {
            let sent_at = packet.send_time.unwrap_or(now);
            if now >= sent_at + self.rto {
                // a retransmission whose own timeout has passed again must
                // not contribute an RTT sample
                packet.resent = now < sent_at + 2 * self.rto;
                packet.send_time = Some(now);
                resend = Some(Bytes::copy_from_slice(&packet.buf));
                break;
            }
        }

        if let Some(batch) = resend.filter(|_| self.is_send_time) {
            if self.is_nacked {
                self.num_resend_attempts = 1;
            } else if self.is_timeout_resend {
                self.num_resend_attempts += 1;
            }
            if self.num_resend_attempts == 1 && self.rto != self.config.initial_rto {
                // loss-based congestion control
                if !self.is_win_dropped {
                    self.window_size >>= 1;
                    self.is_win_dropped = true;
                    if self.window_size < self.config.min_window_size {
                        self.window_size = self.config.min_window_size;
                    }
                    self.update_pacing_time();
                }
            } else if self.is_timeout_resend {
                self.is_timeout_resend = false;
                // repeated timeouts: treat the path as dead and start over
                self.rto = self.config.initial_rto;
                self.window_size = self.config.initial_window_size;
                self.is_win_dropped = true;
                self.update_pacing_time();
                if let Some(session) = &self.routing_session {
                    session.set_shared_routing_path(None);
                }
                if self.num_resend_attempts & 1 == 1 {
                    self.rotate_outbound_tunnel();
                    warn!(
                        attempt = self.num_resend_attempts,
                        ssid = self.send_stream_id,
                        "resend: another outbound tunnel selected"
                    );
                } else {
                    self.update_current_remote_lease(now, false);
                    self.tunnels_change_seqn = self.sequence_number;
                    warn!(
                        attempt = self.num_resend_attempts,
                        rsid = self.recv_stream_id,
                        ssid = self.send_stream_id,
                        "resend: another remote lease selected"
                    );
                }
            }
            self.send_packets(now, &[batch]);
            self.is_send_time = false;
            if self.is_nacked {
                self.schedule_send(now);
            }
        } else {
            self.send_buffered(now, pool);
        }
        if !self.is_nacked {
            self.schedule_resend(now);
        }
    }

    fn update_pacing_time(&mut self) {
        let window = self.window_size.max(1);
        let micros = (self.rtt * 1_000.0 / f64::from(window)).round();
        self.pacing_time = Duration::from_micros((micros as u64).max(1));
        if let Some(min) = self.min_pacing_time {
            if self.pacing_time < min {
                self.pacing_time = min;
            }
        }
    }

    //
    // Teardown
    //

    /// Cancel all timers and callbacks and recycle every held packet
    ///
    /// The destination removes the stream from its tables when it observes
    /// the `Terminated` status after this.
    pub(crate) fn terminate(&mut self, pool: &mut PacketPool) {
        if self.status == StreamStatus::Terminated {
            return;
        }
        self.status = StreamStatus::Terminated;
        self.timers.reset();
        self.send_queue.cancel_all();
        // the receive queue is left alone: the destination salvages unread
        // in-order data for late readers when it drops the stream
        for (_, packet) in std::mem::take(&mut self.sent_packets) {
            pool.release(packet);
        }
        for (_, packet) in std::mem::take(&mut self.saved_packets) {
            pool.release(packet);
        }
        self.events.push_back(StreamEvent::Terminated);
        debug!(rsid = self.recv_stream_id, "stream terminated");
    }

    /// Drain whatever in-order data was never read, recycling the packets
    pub(crate) fn take_unread(&mut self, pool: &mut PacketPool) -> Vec<u8> {
        let mut out = Vec::new();
        for packet in self.receive_queue.drain(..) {
            out.extend_from_slice(packet.data());
            pool.release(packet);
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn window_size(&self) -> u32 {
        self.window_size
    }

    #[cfg(test)]
    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    #[cfg(test)]
    pub(crate) fn rtt_millis(&self) -> f64 {
        self.rtt
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> impl Iterator<Item = u32> + '_ {
        self.sent_packets.keys().copied()
    }

    #[cfg(test)]
    pub(crate) fn saved(&self) -> impl Iterator<Item = u32> + '_ {
        self.saved_packets.keys().copied()
    }

    #[cfg(test)]
    pub(crate) fn next_sequence_number(&self) -> u32 {
        self.sequence_number
    }

    #[cfg(test)]
    pub(crate) fn last_received(&self) -> Option<u32> {
        self.last_received_seqn
    }

    #[cfg(test)]
    pub(crate) fn has_routing_path(&self) -> bool {
        self.current_outbound_tunnel.is_some() && self.current_remote_lease.is_some()
    }

    #[cfg(test)]
    pub(crate) fn pacing_time(&self) -> Duration {
        self.pacing_time
    }

    #[cfg(test)]
    pub(crate) fn config(&self) -> &StreamingConfig {
        &self.config
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("rsid", &self.recv_stream_id)
            .field("ssid", &self.send_stream_id)
            .field("status", &self.status)
            .field("window", &self.window_size)
            .field("in_flight", &self.sent_packets.len())
            .finish_non_exhaustive()
    }
}
