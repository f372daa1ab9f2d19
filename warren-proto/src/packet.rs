use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Instant;

use thiserror::Error;

/// Largest stream packet either side will emit or accept
pub const MAX_PACKET_SIZE: usize = 4096;

/// Fixed header bytes preceding the NACK list
const PREFIX_SIZE: usize = 17;

/// Number of NACK entries whose bytes carry the intended recipient's identity
/// hash in a SYN packet
pub(crate) const SYN_DEST_HASH_NACKS: u8 = 8;

/// Flag bits of a stream packet
///
/// Flags are encoded big-endian in the two bytes following the resend-delay
/// field. Options appear in the options region in the order the corresponding
/// flags are enumerated here.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Flags(pub u16);

impl Flags {
    /// First packet of a stream; carries the handshake options
    pub const SYNCHRONIZE: Flags = Flags(0x0001);
    /// Sender has finished transmitting
    pub const CLOSE: Flags = Flags(0x0002);
    /// Abortive close
    pub const RESET: Flags = Flags(0x0004);
    /// Options carry a signature over the whole packet
    pub const SIGNATURE_INCLUDED: Flags = Flags(0x0008);
    /// Peer asks that our next packet be signed
    pub const SIGNATURE_REQUESTED: Flags = Flags(0x0010);
    /// Options carry the sender's serialized identity
    pub const FROM_INCLUDED: Flags = Flags(0x0020);
    /// Options carry a requested ACK delay in milliseconds
    pub const DELAY_REQUESTED: Flags = Flags(0x0040);
    /// Options carry the sender's maximum packet size
    pub const MAX_PACKET_SIZE_INCLUDED: Flags = Flags(0x0080);
    /// Ping or pong; never part of a stream
    pub const ECHO: Flags = Flags(0x0200);
    /// The ackThrough field is meaningless (nothing received yet)
    pub const NO_ACK: Flags = Flags(0x0400);
    /// Options carry a transient-key (offline) signature block
    pub const OFFLINE_SIGNATURE: Flags = Flags(0x0800);

    pub(crate) fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A single stream packet, received or about to be sent
///
/// Packets are pooled: the backing buffer keeps its capacity across uses and
/// per-packet heap traffic disappears after warm-up. The fixed header is read
/// in place through the accessors below; `offset` is the read cursor a
/// consumer advances through the payload once the packet has been processed.
///
/// Accessors assume [`Packet::check`] has accepted the buffer; the
/// demultiplexer runs it on every inbound packet before anything else looks
/// at the bytes.
pub struct Packet {
    pub(crate) buf: Vec<u8>,
    pub(crate) offset: usize,
    pub(crate) send_time: Option<Instant>,
    pub(crate) resent: bool,
}

impl Packet {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_PACKET_SIZE),
            offset: 0,
            send_time: None,
            resent: false,
        }
    }

    /// Validate that `buf` is a structurally well-formed stream packet
    pub fn check(buf: &[u8]) -> Result<(), PacketDecodeError> {
        if buf.len() < PREFIX_SIZE {
            return Err(PacketDecodeError::TooShort);
        }
        let nack_count = buf[16] as usize;
        let after_nacks = PREFIX_SIZE + 4 * nack_count;
        // resend delay (1) + flags (2) + options size (2)
        if buf.len() < after_nacks + 5 {
            return Err(PacketDecodeError::TooShort);
        }
        let options_size = u16::from_be_bytes([buf[after_nacks + 3], buf[after_nacks + 4]]) as usize;
        if buf.len() < after_nacks + 5 + options_size {
            return Err(PacketDecodeError::OptionsOverrun);
        }
        Ok(())
    }

    /// Number of bytes remaining behind the read cursor
    pub fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Whether the read cursor has consumed the whole buffer
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes behind the read cursor
    pub fn data(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.offset = 0;
        self.send_time = None;
        self.resent = false;
    }

    fn be32(&self, at: usize) -> u32 {
        u32::from_be_bytes(self.buf[at..at + 4].try_into().unwrap())
    }

    fn be16(&self, at: usize) -> u16 {
        u16::from_be_bytes(self.buf[at..at + 2].try_into().unwrap())
    }

    pub(crate) fn send_stream_id(&self) -> u32 {
        self.be32(0)
    }

    pub(crate) fn receive_stream_id(&self) -> u32 {
        self.be32(4)
    }

    pub(crate) fn seqn(&self) -> u32 {
        self.be32(8)
    }

    pub(crate) fn ack_through(&self) -> u32 {
        self.be32(12)
    }

    pub(crate) fn nack_count(&self) -> u8 {
        self.buf[16]
    }

    pub(crate) fn nack(&self, i: usize) -> u32 {
        self.be32(PREFIX_SIZE + 4 * i)
    }

    /// The raw NACK region
    pub(crate) fn nacks_bytes(&self) -> &[u8] {
        &self.buf[PREFIX_SIZE..PREFIX_SIZE + 4 * self.nack_count() as usize]
    }

    /// The NACK region bytes of a SYN carrying a destination hash
    pub(crate) fn syn_dest_hash(&self) -> Option<&[u8]> {
        if self.is_syn() && self.nack_count() == SYN_DEST_HASH_NACKS {
            Some(&self.buf[PREFIX_SIZE..PREFIX_SIZE + 32])
        } else {
            None
        }
    }

    fn after_nacks(&self) -> usize {
        PREFIX_SIZE + 4 * self.nack_count() as usize
    }

    pub(crate) fn resend_delay(&self) -> u8 {
        self.buf[self.after_nacks()]
    }

    pub(crate) fn flags(&self) -> Flags {
        Flags(self.be16(self.after_nacks() + 1))
    }

    pub(crate) fn options_size(&self) -> usize {
        self.be16(self.after_nacks() + 3) as usize
    }

    /// Offset of the options region within the buffer
    pub(crate) fn options_offset(&self) -> usize {
        self.after_nacks() + 5
    }

    pub(crate) fn option_data(&self) -> &[u8] {
        let start = self.options_offset();
        &self.buf[start..start + self.options_size()]
    }

    /// Offset of the payload within the buffer
    pub(crate) fn payload_offset(&self) -> usize {
        self.options_offset() + self.options_size()
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    pub(crate) fn is_syn(&self) -> bool {
        self.flags().contains(Flags::SYNCHRONIZE)
    }

    pub(crate) fn is_echo(&self) -> bool {
        self.flags().contains(Flags::ECHO)
    }

    pub(crate) fn is_no_ack(&self) -> bool {
        self.flags().contains(Flags::NO_ACK)
    }

    /// A bare acknowledgement: sequence number zero and no flags at all
    pub(crate) fn is_plain_ack(&self) -> bool {
        self.seqn() == 0 && self.flags().is_empty()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // half-built packets would send the accessors out of bounds
        if Packet::check(&self.buf).is_ok() {
            f.debug_struct("Packet")
                .field("seqn", &self.seqn())
                .field("flags", &self.flags())
                .field("len", &self.buf.len())
                .field("resent", &self.resent)
                .finish()
        } else {
            f.debug_struct("Packet")
                .field("len", &self.buf.len())
                .finish_non_exhaustive()
        }
    }
}

/// Recycler for packet buffers
///
/// Drained whenever the owning destination's stream table empties, so an idle
/// destination holds no buffers.
#[derive(Default)]
pub(crate) struct PacketPool {
    free: Vec<Packet>,
}

impl PacketPool {
    pub(crate) fn acquire(&mut self) -> Packet {
        self.free.pop().unwrap_or_else(Packet::new)
    }

    pub(crate) fn release(&mut self, mut packet: Packet) {
        packet.reset();
        self.free.push(packet);
    }

    pub(crate) fn clear(&mut self) {
        self.free.clear();
    }
}

/// Ways an inbound buffer can fail structural validation
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PacketDecodeError {
    /// Buffer ends inside the fixed header or NACK list
    #[error("packet too short for its header")]
    TooShort,
    /// Declared options region runs past the end of the buffer
    #[error("options region overruns packet")]
    OptionsOverrun,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn build(
        send_id: u32,
        recv_id: u32,
        seqn: u32,
        ack_through: u32,
        nacks: &[u32],
        flags: Flags,
        options: &[u8],
        payload: &[u8],
    ) -> Packet {
        let mut p = Packet::new();
        p.buf.put_u32(send_id);
        p.buf.put_u32(recv_id);
        p.buf.put_u32(seqn);
        p.buf.put_u32(ack_through);
        p.buf.put_u8(nacks.len() as u8);
        for &nack in nacks {
            p.buf.put_u32(nack);
        }
        p.buf.put_u8(0); // resend delay
        p.buf.put_u16(flags.0);
        p.buf.put_u16(options.len() as u16);
        p.buf.put_slice(options);
        p.buf.put_slice(payload);
        p
    }

    #[test]
    fn header_fields_round_trip() {
        let p = build(
            0x11223344,
            0x55667788,
            7,
            3,
            &[4, 6],
            Flags::CLOSE | Flags::SIGNATURE_INCLUDED,
            &[0xAA, 0xBB],
            b"hello",
        );
        Packet::check(&p.buf).unwrap();
        assert_eq!(p.send_stream_id(), 0x11223344);
        assert_eq!(p.receive_stream_id(), 0x55667788);
        assert_eq!(p.seqn(), 7);
        assert_eq!(p.ack_through(), 3);
        assert_eq!(p.nack_count(), 2);
        assert_eq!(p.nack(0), 4);
        assert_eq!(p.nack(1), 6);
        assert!(p.flags().contains(Flags::CLOSE));
        assert!(!p.flags().contains(Flags::SYNCHRONIZE));
        assert_eq!(p.option_data(), &[0xAA, 0xBB]);
        assert_eq!(p.payload(), b"hello");
        assert!(!p.is_plain_ack());
    }

    #[test]
    fn plain_ack_detection() {
        let p = build(1, 2, 0, 9, &[], Flags::default(), &[], &[]);
        assert!(p.is_plain_ack());
        let p = build(1, 2, 0, 9, &[], Flags::NO_ACK, &[], &[]);
        assert!(!p.is_plain_ack());
    }

    #[test]
    fn syn_dest_hash_only_on_syn_with_eight_nacks() {
        let hash = [0x42u8; 32];
        let nacks: Vec<u32> = hash
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        let p = build(0, 2, 0, 0, &nacks, Flags::SYNCHRONIZE, &[], &[]);
        assert_eq!(p.syn_dest_hash(), Some(&hash[..]));
        // same NACK list without SYNCHRONIZE is an ordinary NACK set
        let p = build(1, 2, 0, 0, &nacks, Flags::default(), &[], &[]);
        assert_eq!(p.syn_dest_hash(), None);
    }

    #[test]
    fn check_rejects_truncation() {
        let p = build(1, 2, 3, 0, &[9, 10, 11], Flags::default(), &[], b"xy");
        Packet::check(&p.buf).unwrap();
        // cut inside the NACK list
        assert_eq!(
            Packet::check(&p.buf[..20]),
            Err(PacketDecodeError::TooShort)
        );
        // declared options larger than the remaining bytes
        let mut p = build(1, 2, 3, 0, &[], Flags::default(), &[1, 2, 3], &[]);
        let at = p.buf.len() - 5;
        p.buf[at] = 0xFF;
        assert_eq!(
            Packet::check(&p.buf),
            Err(PacketDecodeError::OptionsOverrun)
        );
    }

    #[test]
    fn pool_recycles_buffers() {
        let mut pool = PacketPool::default();
        let mut p = pool.acquire();
        p.buf.extend_from_slice(&[0u8; 64]);
        p.offset = 10;
        p.resent = true;
        let cap = p.buf.capacity();
        pool.release(p);
        let p = pool.acquire();
        assert_eq!(p.buf.len(), 0);
        assert_eq!(p.offset, 0);
        assert!(!p.resent);
        assert!(p.buf.capacity() >= cap);
    }
}
