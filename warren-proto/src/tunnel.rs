//! Interfaces to the tunnel and garlic substrate.
//!
//! The protocol core never talks to the network: it selects a lease and an
//! outbound tunnel, wraps each packet through the remote's routing session,
//! and hands the result to the tunnel as a batch of
//! [`TunnelMessageBlock`]s. Everything behind these traits — tunnel
//! construction, leaseset lookup and publication, garlic encryption — is the
//! embedder's concern. Tests drive the core through in-memory
//! implementations.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::identity::{IdentHash, Identity, PrivateKeys, Verifier};

/// A time-bounded capability to reach the remote destination through one of
/// its inbound tunnels
#[derive(Debug, Clone)]
pub struct Lease {
    /// Router at the entrance of the remote's inbound tunnel
    pub tunnel_gateway: IdentHash,
    /// Tunnel id at that gateway
    pub tunnel_id: u32,
    /// When the lease stops being usable
    pub expires: Instant,
}

/// The signed collection of a destination's current leases
pub trait LeaseSet: Send + Sync {
    /// Identity of the destination that published this leaseset
    fn identity(&self) -> &Identity;
    /// Every lease in the set, expired or not
    fn leases(&self) -> Vec<Lease>;
    /// Whether the set as a whole is past its expiry
    fn is_expired(&self, now: Instant) -> bool;
    /// Whether the set is published under an encrypted (blinded) address
    fn is_published_encrypted(&self) -> bool {
        false
    }
    /// Transient verifier published alongside the leases, if the destination
    /// signs with an offline key
    fn transient_verifier(&self) -> Option<Verifier> {
        None
    }
}

/// Leases usable at `now`, optionally tolerating `grace` past the end date
pub(crate) fn non_expired_leases(
    leaseset: &dyn LeaseSet,
    now: Instant,
    grace: Option<Duration>,
) -> Vec<Lease> {
    let grace = grace.unwrap_or_default();
    let mut leases = leaseset.leases();
    leases.retain(|lease| now < lease.expires + grace);
    leases
}

/// A garlic session to one remote destination
///
/// Implementations are internally synchronized; the shared routing path in
/// particular is read and replaced from whichever stream last measured it.
pub trait RoutingSession: Send + Sync {
    /// Garlic-wrap one message for the remote
    fn wrap_single_message(&self, msg: Bytes) -> Bytes;
    /// Path last published for this remote, shared across its streams
    fn shared_routing_path(&self) -> Option<SharedRoutingPath>;
    /// Publish or invalidate the shared path
    fn set_shared_routing_path(&self, path: Option<SharedRoutingPath>);
    /// Whether the session uses the ratchet protocol (affects the MTU)
    fn is_ratchets(&self) -> bool;
    /// Whether the session can wrap messages right now
    fn is_ready_to_send(&self) -> bool {
        true
    }
    /// Whether the session has been torn down and must be re-acquired
    fn is_terminated(&self) -> bool {
        false
    }
    /// Whether our own leaseset still awaits the peer's confirmation
    fn is_leaseset_non_confirmed(&self) -> bool {
        false
    }
    /// Whether our leaseset changed and should be re-announced
    fn is_leaseset_updated(&self) -> bool {
        false
    }
    /// When our leaseset was last submitted to the peer
    fn leaseset_submission_time(&self) -> Option<Instant> {
        None
    }
}

/// The path one stream measured and every stream to the same remote may reuse
#[derive(Clone)]
pub struct SharedRoutingPath {
    /// Local outbound tunnel the measurement used
    pub outbound_tunnel: Arc<dyn OutboundTunnel>,
    /// Remote lease the measurement used
    pub remote_lease: Lease,
    /// Round-trip time observed over this pair
    pub rtt: Duration,
}

impl fmt::Debug for SharedRoutingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRoutingPath")
            .field("gateway", &self.remote_lease.tunnel_gateway)
            .field("tunnel_id", &self.remote_lease.tunnel_id)
            .field("rtt", &self.rtt)
            .finish()
    }
}

/// How a message leaving through an outbound tunnel is to be delivered
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryType {
    /// To the endpoint router itself
    Local,
    /// Into a tunnel at a gateway router (the streaming case)
    Tunnel,
    /// To a router
    Router,
}

/// One garlic message plus its delivery instructions
pub struct TunnelMessageBlock {
    /// How the tunnel endpoint should forward the message
    pub delivery_type: DeliveryType,
    /// Gateway router of the remote's inbound tunnel
    pub gateway: IdentHash,
    /// Tunnel id at that gateway
    pub tunnel_id: u32,
    /// The wrapped message
    pub message: Bytes,
}

/// A local onion-routed path whose first hop we chose
pub trait OutboundTunnel: Send + Sync {
    /// Whether the tunnel finished building and is usable
    fn is_established(&self) -> bool;
    /// Queue a batch of messages into the tunnel
    ///
    /// Invoked from inside protocol processing; implementations must queue
    /// and return rather than call back into the destination.
    fn send_tunnel_data(&self, blocks: Vec<TunnelMessageBlock>);
}

/// The local pool outbound tunnels are drawn from
pub trait TunnelPool: Send + Sync {
    /// Some established tunnel other than `exclude`, preferring routers able
    /// to talk to `peer_gateway` directly
    fn next_outbound_tunnel(
        &self,
        exclude: Option<&Arc<dyn OutboundTunnel>>,
        peer_gateway: Option<&IdentHash>,
    ) -> Option<Arc<dyn OutboundTunnel>>;

    /// Replacement for a tunnel that stopped being established
    ///
    /// The flag reports whether the returned tunnel differs from `replacing`.
    fn new_outbound_tunnel(
        &self,
        replacing: &Arc<dyn OutboundTunnel>,
    ) -> (Option<Arc<dyn OutboundTunnel>>, bool);
}

/// The owning client destination: identity material plus substrate lookups
pub trait LocalDestination: Send + Sync {
    /// Long-term signing material of this destination
    fn private_keys(&self) -> &PrivateKeys;
    /// Leaseset for `ident`, if the netdb has one
    fn find_leaseset(&self, ident: &IdentHash) -> Option<Arc<dyn LeaseSet>>;
    /// Kick off a netdb lookup for `ident`; the result arrives via
    /// `find_leaseset` some time later
    fn request_destination(&self, ident: &IdentHash);
    /// Acquire (or refresh) the garlic session for a remote
    fn routing_session(&self, leaseset: &Arc<dyn LeaseSet>) -> Option<Arc<dyn RoutingSession>>;
    /// The pool our outbound tunnels come from
    fn tunnel_pool(&self) -> &dyn TunnelPool;
    /// Wall-clock seconds since the Unix epoch, for offline-signature expiry
    fn unix_time(&self) -> Duration;
}

/// Byte-range compression applied to stream payloads inside data messages
pub trait Compression: Send + Sync {
    /// Compress `data`, appending to `out`
    fn deflate(&self, data: &[u8], out: &mut Vec<u8>);
    /// Decompress `data`, appending at most `max` bytes to `out`; `None` on
    /// corrupt input
    fn inflate(&self, data: &[u8], out: &mut Vec<u8>, max: usize) -> Option<usize>;
}

/// Pass-through for embedders whose garlic layer already compresses (or whose
/// traffic does not benefit)
#[derive(Debug, Default, Copy, Clone)]
pub struct NoCompression;

impl Compression for NoCompression {
    fn deflate(&self, data: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(data);
    }

    fn inflate(&self, data: &[u8], out: &mut Vec<u8>, max: usize) -> Option<usize> {
        if data.len() > max {
            return None;
        }
        out.extend_from_slice(data);
        Some(data.len())
    }
}
