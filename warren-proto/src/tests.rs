//! Deterministic two-destination tests over an in-memory substrate with
//! virtual time. The harness mirrors real deployment: every packet goes
//! through the data-message framing, the (pass-through) compressor, a fake
//! routing session, and a fake tunnel, with a configurable one-way latency
//! plus per-sequence-number drop and delay knobs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes};

use crate::config::StreamingConfig;
use crate::destination::Destination;
use crate::identity::{IdentHash, Identity, PrivateKeys, Verifier};
use crate::packet::{Flags, Packet};
use crate::send_buffer::WriteError;
use crate::shared::{Event, StreamEvent};
use crate::stream::{Stream, StreamStatus};
use crate::tunnel::{
    Lease, LeaseSet, LocalDestination, NoCompression, OutboundTunnel, RoutingSession,
    SharedRoutingPath, TunnelMessageBlock, TunnelPool,
};
use crate::StreamId;

/// Bytes of data-message framing before the stream packet
const MSG_HEADER: usize = 9;

fn wire_seqn(msg: &[u8]) -> u32 {
    u32::from_be_bytes(msg[MSG_HEADER + 8..MSG_HEADER + 12].try_into().unwrap())
}

fn wire_packet(msg: &[u8]) -> Packet {
    let mut packet = Packet::new();
    packet.buf.extend_from_slice(&msg[MSG_HEADER..]);
    Packet::check(&packet.buf).unwrap();
    packet
}

struct Delivery {
    to: IdentHash,
    at: Instant,
    msg: Bytes,
}

/// The wire: stamps arrival times and applies loss/delay knobs
struct Net {
    clock: Mutex<Instant>,
    latency: Duration,
    inbox: Mutex<Vec<Delivery>>,
    drop_once: Mutex<HashSet<(IdentHash, u32)>>,
    delay_once: Mutex<HashMap<(IdentHash, u32), Duration>>,
    blocked: Mutex<HashSet<IdentHash>>,
    log: Mutex<Vec<(IdentHash, Bytes)>>,
}

impl Net {
    fn new(now: Instant, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock: Mutex::new(now),
            latency,
            inbox: Mutex::new(Vec::new()),
            drop_once: Mutex::new(HashSet::new()),
            delay_once: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    fn send(&self, to: IdentHash, msg: Bytes) {
        self.log.lock().unwrap().push((to, msg.clone()));
        if self.blocked.lock().unwrap().contains(&to) {
            return;
        }
        let seqn = wire_seqn(&msg);
        if self.drop_once.lock().unwrap().remove(&(to, seqn)) {
            return;
        }
        let mut at = *self.clock.lock().unwrap() + self.latency;
        if let Some(extra) = self.delay_once.lock().unwrap().remove(&(to, seqn)) {
            at += extra;
        }
        self.inbox.lock().unwrap().push(Delivery { to, at, msg });
    }

    fn next_arrival(&self) -> Option<Instant> {
        self.inbox.lock().unwrap().iter().map(|d| d.at).min()
    }

    fn take_due(&self, now: Instant) -> Vec<Delivery> {
        let mut inbox = self.inbox.lock().unwrap();
        let mut due = Vec::new();
        let mut rest = Vec::new();
        for delivery in inbox.drain(..) {
            if delivery.at <= now {
                due.push(delivery);
            } else {
                rest.push(delivery);
            }
        }
        *inbox = rest;
        due.sort_by_key(|d| d.at);
        due
    }

    fn sent_to(&self, to: IdentHash) -> Vec<Bytes> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(hash, _)| *hash == to)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

struct TestTunnel {
    net: Arc<Net>,
    established: AtomicBool,
}

impl OutboundTunnel for TestTunnel {
    fn is_established(&self) -> bool {
        self.established.load(Ordering::Relaxed)
    }

    fn send_tunnel_data(&self, blocks: Vec<TunnelMessageBlock>) {
        for block in blocks {
            self.net.send(block.gateway, block.message);
        }
    }
}

struct TestPool {
    tunnels: Vec<Arc<dyn OutboundTunnel>>,
}

impl TunnelPool for TestPool {
    fn next_outbound_tunnel(
        &self,
        exclude: Option<&Arc<dyn OutboundTunnel>>,
        _peer_gateway: Option<&IdentHash>,
    ) -> Option<Arc<dyn OutboundTunnel>> {
        self.tunnels
            .iter()
            .find(|t| exclude.map_or(true, |e| !Arc::ptr_eq(*t, e)))
            .or(self.tunnels.first())
            .cloned()
    }

    fn new_outbound_tunnel(
        &self,
        replacing: &Arc<dyn OutboundTunnel>,
    ) -> (Option<Arc<dyn OutboundTunnel>>, bool) {
        let replacement = self.next_outbound_tunnel(Some(replacing), None);
        let fresh = replacement
            .as_ref()
            .map_or(false, |t| !Arc::ptr_eq(t, replacing));
        (replacement, fresh)
    }
}

#[derive(Default)]
struct TestSession {
    path: Mutex<Option<SharedRoutingPath>>,
}

impl RoutingSession for TestSession {
    fn wrap_single_message(&self, msg: Bytes) -> Bytes {
        msg
    }

    fn shared_routing_path(&self) -> Option<SharedRoutingPath> {
        self.path.lock().unwrap().clone()
    }

    fn set_shared_routing_path(&self, path: Option<SharedRoutingPath>) {
        *self.path.lock().unwrap() = path;
    }

    fn is_ratchets(&self) -> bool {
        false
    }
}

struct TestLeaseSet {
    identity: Identity,
    leases: Vec<Lease>,
    transient: Option<Verifier>,
}

impl LeaseSet for TestLeaseSet {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn leases(&self) -> Vec<Lease> {
        self.leases.clone()
    }

    fn is_expired(&self, _now: Instant) -> bool {
        false
    }

    fn transient_verifier(&self) -> Option<Verifier> {
        self.transient.clone()
    }
}

struct TestLocal {
    keys: PrivateKeys,
    peers: Mutex<HashMap<IdentHash, Arc<dyn LeaseSet>>>,
    sessions: Mutex<HashMap<IdentHash, Arc<TestSession>>>,
    pool: TestPool,
}

impl LocalDestination for TestLocal {
    fn private_keys(&self) -> &PrivateKeys {
        &self.keys
    }

    fn find_leaseset(&self, ident: &IdentHash) -> Option<Arc<dyn LeaseSet>> {
        self.peers.lock().unwrap().get(ident).cloned()
    }

    fn request_destination(&self, _ident: &IdentHash) {}

    fn routing_session(&self, leaseset: &Arc<dyn LeaseSet>) -> Option<Arc<dyn RoutingSession>> {
        let hash = *leaseset.identity().hash();
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(hash).or_default();
        Some(session.clone() as Arc<dyn RoutingSession>)
    }

    fn tunnel_pool(&self) -> &dyn TunnelPool {
        &self.pool
    }

    fn unix_time(&self) -> Duration {
        Duration::from_secs(1_700_000_000)
    }
}

struct TestEndpoint {
    dest: Destination,
    hash: IdentHash,
    leaseset: Arc<dyn LeaseSet>,
    events: Vec<Event>,
}

impl TestEndpoint {
    fn incoming(&self) -> Vec<StreamId> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::IncomingStream(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn stream_events(&self, id: StreamId) -> Vec<StreamEvent> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Stream(at, ev) if *at == id => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    fn read_all(&mut self, id: StreamId) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while let Some(n) = self.dest.read(id, &mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }
}

struct Pair {
    time: Instant,
    net: Arc<Net>,
    a: TestEndpoint,
    b: TestEndpoint,
}

impl Pair {
    fn new() -> Self {
        Self::with_config(StreamingConfig::default(), false)
    }

    fn with_config(config: StreamingConfig, a_offline: bool) -> Self {
        let time = Instant::now();
        let net = Net::new(time, Duration::from_millis(50));
        let keys_a = if a_offline {
            PrivateKeys::from_seed_with_transient(&[1u8; 32], &[9u8; 32], u32::MAX).unwrap()
        } else {
            PrivateKeys::from_seed(&[1u8; 32]).unwrap()
        };
        let keys_b = PrivateKeys::from_seed(&[2u8; 32]).unwrap();
        let transient_a = keys_a
            .offline_signature()
            .map(|offline| offline.verifier().clone());
        let ls_a: Arc<dyn LeaseSet> = Arc::new(TestLeaseSet {
            identity: keys_a.identity().clone(),
            leases: leases_for(*keys_a.identity().hash(), time),
            transient: transient_a,
        });
        let ls_b: Arc<dyn LeaseSet> = Arc::new(TestLeaseSet {
            identity: keys_b.identity().clone(),
            leases: leases_for(*keys_b.identity().hash(), time),
            transient: None,
        });
        let a = Self::endpoint(keys_a, &net, &config, &ls_a, &ls_b);
        let b = Self::endpoint(keys_b, &net, &config, &ls_b, &ls_a);
        Self { time, net, a, b }
    }

    fn endpoint(
        keys: PrivateKeys,
        net: &Arc<Net>,
        config: &StreamingConfig,
        own_leaseset: &Arc<dyn LeaseSet>,
        peer_leaseset: &Arc<dyn LeaseSet>,
    ) -> TestEndpoint {
        let hash = *keys.identity().hash();
        let tunnels: Vec<Arc<dyn OutboundTunnel>> = (0..2)
            .map(|_| {
                Arc::new(TestTunnel {
                    net: net.clone(),
                    established: AtomicBool::new(true),
                }) as Arc<dyn OutboundTunnel>
            })
            .collect();
        let peer_hash = *peer_leaseset.identity().hash();
        let local = Arc::new(TestLocal {
            keys,
            peers: Mutex::new(HashMap::from([(peer_hash, peer_leaseset.clone())])),
            sessions: Mutex::new(HashMap::new()),
            pool: TestPool { tunnels },
        });
        TestEndpoint {
            dest: Destination::new(local, config.clone(), Arc::new(NoCompression), 0),
            hash,
            leaseset: own_leaseset.clone(),
            events: Vec::new(),
        }
    }

    fn endpoint_mut(&mut self, to: IdentHash) -> &mut TestEndpoint {
        if to == self.a.hash {
            &mut self.a
        } else {
            &mut self.b
        }
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.a.dest.poll_event() {
            self.a.events.push(event);
        }
        while let Some(event) = self.b.dest.poll_event() {
            self.b.events.push(event);
        }
    }

    fn deliver_due(&mut self) {
        loop {
            let due = self.net.take_due(self.time);
            if due.is_empty() {
                break;
            }
            for delivery in due {
                let time = self.time;
                let endpoint = self.endpoint_mut(delivery.to);
                endpoint
                    .dest
                    .handle_data_payload(time, &delivery.msg[MSG_HEADER..]);
            }
        }
        self.collect_events();
    }

    fn next_wakeup(&mut self) -> Option<Instant> {
        [
            self.a.dest.next_timeout(),
            self.b.dest.next_timeout(),
            self.net.next_arrival(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn advance_to(&mut self, time: Instant) {
        self.time = time;
        *self.net.clock.lock().unwrap() = time;
        self.a.dest.handle_timeout(time);
        self.b.dest.handle_timeout(time);
        self.deliver_due();
    }

    /// Advance virtual time until both sides are idle
    fn drive(&mut self) {
        for _ in 0..50_000 {
            self.deliver_due();
            let Some(next) = self.next_wakeup() else {
                return;
            };
            self.advance_to(next.max(self.time));
        }
        panic!("pair failed to go idle");
    }

    /// Advance virtual time, but not beyond `deadline`
    fn drive_until(&mut self, deadline: Instant) {
        for _ in 0..50_000 {
            self.deliver_due();
            match self.next_wakeup() {
                Some(next) if next <= deadline => self.advance_to(next.max(self.time)),
                _ => {
                    self.advance_to(deadline.max(self.time));
                    return;
                }
            }
        }
        panic!("pair failed to reach deadline");
    }

    /// Give in-flight exchanges ample virtual time, staying clear of the
    /// ten-second pending-accept deadline
    fn settle(&mut self) {
        let deadline = self.time + Duration::from_secs(5);
        self.drive_until(deadline);
    }

    /// Open a stream from A to B carrying `payload`, drive the handshake to
    /// completion, and return both stream ids
    fn connect(&mut self, payload: &[u8]) -> (StreamId, StreamId) {
        let a_id = self
            .a
            .dest
            .create_outgoing_stream(self.b.leaseset.clone(), 0);
        self.a
            .dest
            .write(a_id, self.time, Bytes::copy_from_slice(payload), None)
            .unwrap();
        self.settle();
        let incoming = self.b.incoming();
        assert_eq!(incoming.len(), 1);
        let b_id = incoming[0];
        assert_eq!(self.b.dest.accept(), Some(b_id));
        (a_id, b_id)
    }

    /// Queue `chunk` and let pacing move it out before the next one
    fn write_spaced(&mut self, id: StreamId, chunk: Vec<u8>) {
        self.a
            .dest
            .write(id, self.time, chunk.into(), None)
            .unwrap();
        let gap = self.time + Duration::from_millis(30);
        self.drive_until(gap);
    }

    fn a_stream(&self, id: StreamId) -> &Stream {
        self.a.dest.stream(id).unwrap()
    }

    fn b_stream(&self, id: StreamId) -> &Stream {
        self.b.dest.stream(id).unwrap()
    }
}

fn leases_for(gateway: IdentHash, now: Instant) -> Vec<Lease> {
    (1..=2)
        .map(|tunnel_id| Lease {
            tunnel_gateway: gateway,
            tunnel_id,
            expires: now + Duration::from_secs(3_600),
        })
        .collect()
}

fn assert_stream_invariants(stream: &Stream) {
    let config = stream.config();
    assert!(stream.window_size() >= config.min_window_size);
    assert!(stream.window_size() <= config.max_window_size);
    assert!(stream.rto() >= config.min_rto);
    for seqn in stream.in_flight() {
        assert!(seqn < stream.next_sequence_number());
    }
    if let Some(last) = stream.last_received() {
        for seqn in stream.saved() {
            assert!(seqn > last + 1);
        }
    }
}

#[test]
fn handshake_and_single_payload() {
    let mut pair = Pair::new();
    let payload = vec![0x5Au8; 100];
    let (a_id, b_id) = pair.connect(&payload);

    // the first thing on the wire was a signed SYN with our identity, the
    // destination hash in the NACK field, and the payload aboard
    let syn = wire_packet(&pair.net.sent_to(pair.b.hash)[0]);
    assert_eq!(syn.seqn(), 0);
    assert!(syn.flags().contains(Flags::SYNCHRONIZE));
    assert!(syn.flags().contains(Flags::NO_ACK));
    assert!(syn.flags().contains(Flags::FROM_INCLUDED));
    assert!(syn.flags().contains(Flags::SIGNATURE_INCLUDED));
    assert!(syn.flags().contains(Flags::MAX_PACKET_SIZE_INCLUDED));
    assert_eq!(syn.nack_count(), 8);
    assert_eq!(syn.nacks_bytes(), &pair.b.hash.0[..]);
    assert_eq!(syn.payload(), &payload[..]);

    // B's answer was a SYN too, acking ours, without NO_ACK
    let syn_ack = wire_packet(&pair.net.sent_to(pair.a.hash)[0]);
    assert!(syn_ack.flags().contains(Flags::SYNCHRONIZE));
    assert!(!syn_ack.flags().contains(Flags::NO_ACK));
    assert_eq!(syn_ack.ack_through(), 0);

    assert_eq!(pair.a_stream(a_id).status(), StreamStatus::Open);
    assert_eq!(pair.b_stream(b_id).status(), StreamStatus::Open);
    assert!(pair.a_stream(a_id).is_established());
    assert!(pair.b_stream(b_id).is_established());
    assert_eq!(pair.a_stream(a_id).in_flight().count(), 0);
    assert_eq!(pair.b_stream(b_id).in_flight().count(), 0);

    // one round trip at 50ms each way
    let rtt = pair.a_stream(a_id).rtt_millis();
    assert!((90.0..250.0).contains(&rtt), "rtt {rtt}");

    assert_eq!(pair.b.read_all(b_id), payload);
    assert!(pair.a.stream_events(a_id).contains(&StreamEvent::Opened));

    assert_stream_invariants(pair.a_stream(a_id));
    assert_stream_invariants(pair.b_stream(b_id));
}

#[test]
fn in_order_delivery_grows_window() {
    let mut pair = Pair::new();
    let (a_id, b_id) = pair.connect(b"hello");
    pair.b.read_all(b_id);
    let window_before = pair.a_stream(a_id).window_size();

    let mut sent = Vec::new();
    for i in 0..3u8 {
        let chunk = vec![i; 600];
        sent.extend_from_slice(&chunk);
        pair.write_spaced(a_id, chunk);
    }
    pair.settle();

    // delivered in order, exactly once
    assert_eq!(pair.b.read_all(b_id), sent);
    // one window increment per ACKed packet
    assert_eq!(pair.a_stream(a_id).window_size(), window_before + 3);
    assert_eq!(pair.a_stream(a_id).in_flight().count(), 0);
    assert_stream_invariants(pair.a_stream(a_id));
    assert_stream_invariants(pair.b_stream(b_id));
}

#[test]
fn reordered_packets_are_buffered_and_drained() {
    let mut pair = Pair::new();
    let (a_id, b_id) = pair.connect(b"start,");
    pair.b.read_all(b_id);

    // seq 1 limps along; seq 2 overtakes it
    pair.net
        .delay_once
        .lock()
        .unwrap()
        .insert((pair.b.hash, 1), Duration::from_millis(400));
    pair.write_spaced(a_id, b"first,".to_vec());
    pair.write_spaced(a_id, b"second".to_vec());
    pair.settle();

    assert_eq!(pair.b.read_all(b_id), b"first,second");
    assert_eq!(pair.b_stream(b_id).saved().count(), 0);
    assert_eq!(pair.b_stream(b_id).last_received(), Some(2));
    assert_stream_invariants(pair.a_stream(a_id));
    assert_stream_invariants(pair.b_stream(b_id));
}

#[test]
fn loss_triggers_nacks_and_fast_retransmit() {
    let mut pair = Pair::new();
    let (a_id, b_id) = pair.connect(b"!");
    pair.b.read_all(b_id);
    let log_mark = pair.net.sent_to(pair.b.hash).len();

    pair.net.drop_once.lock().unwrap().insert((pair.b.hash, 3));
    let mut sent = Vec::new();
    for i in 0..6u8 {
        let chunk = vec![b'a' + i; 500];
        sent.extend_from_slice(&chunk);
        pair.write_spaced(a_id, chunk);
    }
    pair.settle();

    // everything arrived despite the hole
    assert_eq!(pair.b.read_all(b_id), sent);
    assert_eq!(pair.a_stream(a_id).in_flight().count(), 0);

    // B NACKed exactly the missing sequence number
    let nacked: Vec<Vec<u32>> = pair
        .net
        .sent_to(pair.a.hash)
        .iter()
        .map(|msg| wire_packet(msg))
        .filter(|p| p.nack_count() > 0 && p.nack_count() != 8)
        .map(|p| (0..p.nack_count() as usize).map(|i| p.nack(i)).collect())
        .collect();
    assert!(nacked.iter().any(|nacks| nacks == &[3]), "{nacked:?}");

    // and A retransmitted seq 3 at least once
    let copies = pair
        .net
        .sent_to(pair.b.hash)
        .iter()
        .skip(log_mark)
        .filter(|msg| wire_seqn(msg) == 3)
        .count();
    assert!(copies >= 2, "seq 3 sent {copies} times");
    assert_stream_invariants(pair.a_stream(a_id));
    assert_stream_invariants(pair.b_stream(b_id));
}

#[test]
fn retransmit_exhaustion_resets_and_cancels() {
    let mut pair = Pair::new();
    // nothing ever reaches B
    pair.net.blocked.lock().unwrap().insert(pair.b.hash);

    let a_id = pair
        .a
        .dest
        .create_outgoing_stream(pair.b.leaseset.clone(), 0);
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    // the first chunk rides the SYN; the second stays queued forever
    pair.a
        .dest
        .write(a_id, pair.time, Bytes::from(vec![1u8; 1730]), None)
        .unwrap();
    pair.a
        .dest
        .write(
            a_id,
            pair.time,
            Bytes::from(vec![2u8; 1730]),
            Some(Box::new(move |result| {
                assert_eq!(result, Err(WriteError::Cancelled));
                flag.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();
    pair.drive();

    let config = StreamingConfig::default();
    let syn_copies = pair.net.sent_to(pair.b.hash).len();
    assert!(
        syn_copies as u32 >= config.max_resend_attempts,
        "only {syn_copies} transmissions"
    );
    assert!(cancelled.load(Ordering::SeqCst));
    assert!(pair.a.dest.stream(a_id).is_none());
    let events = pair.a.stream_events(a_id);
    assert!(events.contains(&StreamEvent::Reset));
    assert_eq!(events.last(), Some(&StreamEvent::Terminated));
}

#[test]
fn choking_request_clamps_window_to_one() {
    let mut pair = Pair::new();
    let (a_id, _b_id) = pair.connect(b"data");
    assert!(pair.a_stream(a_id).window_size() > 1);

    // craft a choking quick-ack addressed to A's stream
    let mut buf = Vec::new();
    buf.put_u32(a_id.0); // sendStreamID: the id A knows itself by
    buf.put_u32(pair.a_stream(a_id).send_stream_id().0);
    buf.put_u32(0); // sequence number
    buf.put_u32(0); // ackThrough
    buf.put_u8(0); // NACK count
    buf.put_u8(0); // resend delay
    buf.put_u16(Flags::DELAY_REQUESTED.0);
    buf.put_u16(2);
    buf.put_u16(StreamingConfig::default().delay_choking);
    let time = pair.time;
    pair.a.dest.handle_packet(time, &buf).unwrap();

    assert_eq!(pair.a_stream(a_id).window_size(), 1);
    // pacing collapses to one packet per RTT
    let pacing = pair.a_stream(a_id).pacing_time();
    let rtt = pair.a_stream(a_id).rtt_millis();
    assert!(pacing >= Duration::from_secs_f64(rtt / 1_000.0).mul_f64(0.99));
    pair.settle();
}

#[test]
fn duplicate_syn_is_dropped_and_repaths() {
    let mut pair = Pair::new();
    let (_a_id, b_id) = pair.connect(b"knock");
    let syn_msg = pair.net.sent_to(pair.b.hash)[0].clone();
    let streams_before = pair.b.dest.len();
    assert!(pair.b_stream(b_id).has_routing_path());

    // the SYN arrives again: our acceptance was evidently lost
    let time = pair.time;
    pair.b
        .dest
        .handle_data_payload(time, &syn_msg[MSG_HEADER..]);
    pair.collect_events();

    assert_eq!(pair.b.dest.len(), streams_before);
    assert_eq!(pair.b.incoming().len(), 1);
    // the ACK will take a different route next time
    assert!(!pair.b_stream(b_id).has_routing_path());
    pair.settle();
}

#[test]
fn orphan_follow_on_waits_for_its_syn() {
    let mut pair = Pair::new();
    let a_id = pair
        .a
        .dest
        .create_outgoing_stream(pair.b.leaseset.clone(), 0);

    // hold the SYN back long enough for the follow-on to arrive first
    pair.net
        .delay_once
        .lock()
        .unwrap()
        .insert((pair.b.hash, 0), Duration::from_millis(300));
    pair.a
        .dest
        .write(a_id, pair.time, Bytes::from_static(b"early"), None)
        .unwrap();

    // a follow-on racing ahead of the handshake (Java peers do this)
    let mut follow_on = Vec::new();
    follow_on.put_u32(0); // sender does not know our id yet
    follow_on.put_u32(a_id.0);
    follow_on.put_u32(1); // next in sequence after the SYN
    follow_on.put_u32(0);
    follow_on.put_u8(0);
    follow_on.put_u8(0);
    follow_on.put_u16(Flags::NO_ACK.0);
    follow_on.put_u16(0);
    follow_on.extend_from_slice(b", late");
    let time = pair.time;
    pair.b.dest.handle_packet(time, &follow_on).unwrap();

    // nothing to deliver it to yet
    let deadline = pair.time + Duration::from_millis(200);
    pair.drive_until(deadline);
    assert!(pair.b.dest.is_empty());
    assert!(pair.b.incoming().is_empty());

    pair.settle();
    let b_id = pair.b.incoming()[0];
    assert_eq!(pair.b.dest.accept(), Some(b_id));
    assert_eq!(pair.b.read_all(b_id), b"early, late");
}

#[test]
fn unclaimed_orphans_are_dropped_after_timeout() {
    let mut pair = Pair::new();
    let mut follow_on = Vec::new();
    follow_on.put_u32(0);
    follow_on.put_u32(0x1234_5678);
    follow_on.put_u32(1);
    follow_on.put_u32(0);
    follow_on.put_u8(0);
    follow_on.put_u8(0);
    follow_on.put_u16(Flags::NO_ACK.0);
    follow_on.put_u16(0);
    follow_on.extend_from_slice(b"nobody home");
    let time = pair.time;
    pair.b.dest.handle_packet(time, &follow_on).unwrap();

    // the bucket expires without ever creating a stream
    pair.drive();
    assert!(pair.b.dest.is_empty());
    assert!(pair.b.incoming().is_empty());
}

#[test]
fn backlog_overflow_closes_excess_incoming_streams() {
    let mut config = StreamingConfig::default();
    config.max_pending_incoming(1);
    let mut pair = Pair::with_config(config, false);

    for _ in 0..2 {
        let id = pair
            .a
            .dest
            .create_outgoing_stream(pair.b.leaseset.clone(), 0);
        pair.a
            .dest
            .write(id, pair.time, Bytes::from_static(b"hi"), None)
            .unwrap();
    }
    let deadline = pair.time + Duration::from_secs(2);
    pair.drive_until(deadline);

    // only the first got queued for accept
    assert_eq!(pair.b.incoming().len(), 1);
    assert_eq!(pair.b.dest.pending_incoming(), 1);
}

#[test]
fn ping_pong_round_trip() {
    let mut pair = Pair::new();
    let time = pair.time;
    let remote = pair.b.leaseset.clone();
    pair.a.dest.send_ping(time, remote);
    pair.drive();

    // B answered without creating a stream
    assert!(pair.b.dest.is_empty());
    let pong = pair
        .net
        .sent_to(pair.a.hash)
        .iter()
        .map(|msg| wire_packet(msg))
        .find(|p| p.is_echo());
    let pong = pong.expect("no pong on the wire");
    assert_eq!(pong.send_stream_id(), 0);
}

#[test]
fn pings_are_ignored_when_answering_is_disabled() {
    let mut config = StreamingConfig::default();
    config.answer_pings(false);
    let mut pair = Pair::with_config(config, false);
    let time = pair.time;
    let remote = pair.b.leaseset.clone();
    pair.a.dest.send_ping(time, remote);
    pair.drive();
    assert!(pair.net.sent_to(pair.a.hash).is_empty());
}

#[test]
fn graceful_close_exchanges_fins() {
    let mut pair = Pair::new();
    let (a_id, b_id) = pair.connect(b"bye");
    pair.b.read_all(b_id);

    let time = pair.time;
    pair.a.dest.close(a_id, time);
    pair.settle();

    // both sides are gone; B saw the close as an EOF
    assert!(pair.a.dest.stream(a_id).is_none());
    assert!(pair.b.dest.stream(b_id).is_none());
    assert!(pair.b.stream_events(b_id).contains(&StreamEvent::Finished));
    let fin = pair
        .net
        .sent_to(pair.b.hash)
        .iter()
        .map(|msg| wire_packet(msg))
        .find(|p| p.flags().contains(Flags::CLOSE));
    assert!(fin.is_some(), "no FIN on the wire");
}

#[test]
fn offline_signature_handshake() {
    let mut pair = Pair::with_config(StreamingConfig::default(), true);
    let (a_id, b_id) = pair.connect(b"signed by a transient key");

    let syn = wire_packet(&pair.net.sent_to(pair.b.hash)[0]);
    assert!(syn.flags().contains(Flags::OFFLINE_SIGNATURE));

    assert_eq!(pair.a_stream(a_id).status(), StreamStatus::Open);
    assert_eq!(pair.b_stream(b_id).status(), StreamStatus::Open);
    assert_eq!(pair.b.read_all(b_id), b"signed by a transient key");
    // B pinned A's long-term identity even though packets carry the
    // transient key's signatures
    assert_eq!(
        pair.b_stream(b_id).remote_identity().unwrap().hash(),
        &pair.a.hash
    );
}

#[test]
fn misrouted_syn_is_dropped() {
    let mut pair = Pair::new();
    let a_id = pair
        .a
        .dest
        .create_outgoing_stream(pair.b.leaseset.clone(), 0);
    pair.a
        .dest
        .write(a_id, pair.time, Bytes::from_static(b"misrouted"), None)
        .unwrap();
    // the SYN is on the wire; keep the clean copy from ever arriving
    let syn_msg = pair.net.sent_to(pair.b.hash)[0].clone();
    pair.net.blocked.lock().unwrap().insert(pair.b.hash);
    pair.net.inbox.lock().unwrap().clear();

    // corrupt the destination hash in the NACK field
    let mut tampered = syn_msg[MSG_HEADER..].to_vec();
    tampered[17] ^= 0xFF;
    let time = pair.time;
    pair.b.dest.handle_packet(time, &tampered).unwrap();
    pair.collect_events();

    assert!(pair.b.incoming().is_empty());
    assert!(pair.b.dest.is_empty());
}
