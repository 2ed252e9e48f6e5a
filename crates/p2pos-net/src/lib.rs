//! Network layer for P2POS on iroh QUIC.
//!
//! This crate defines:
//!
//! - The four stream protocol identifiers (ALPNs) plus peer exchange.
//! - [`message`] — the JSON wire payloads, newline-agnostic, read to EOF.
//! - [`Transport`] — the capability trait the protocol services consume;
//!   [`IrohTransport`] is the production implementation.
//! - [`ConnectionRegistry`] — tracks which peers have live connections and
//!   emits [`PeerConnected`](p2pos_types::events::PeerConnected) /
//!   [`PeerDisconnected`](p2pos_types::events::PeerDisconnected) events.

mod error;
pub mod message;
mod registry;
mod transport;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use p2pos_types::PeerId;

pub use error::NetError;
pub use registry::{ConnectionGuard, ConnectionRegistry};
pub use transport::{IrohTransport, track_connection};

/// Membership snapshot fetch (responder writes `{snapshot, error?}`).
pub const MEMBERSHIP_ALPN: &[u8] = b"/p2pos/membership/1.0.0";
/// Membership snapshot push (initiator writes a snapshot, responder
/// answers `{applied, error?}`).
pub const MEMBERSHIP_PUSH_ALPN: &[u8] = b"/p2pos/membership-push/1.0.0";
/// Signed heartbeat (uni-directional, no response).
pub const HEARTBEAT_ALPN: &[u8] = b"/p2pos/heartbeat/1.0.0";
/// Status query (`{scope}` → `{generated_at, peers, error?}`).
pub const STATUS_ALPN: &[u8] = b"/p2pos/status/1.0.0";
/// Known-peer exchange (responder writes its peer records).
pub const PEER_EXCHANGE_ALPN: &[u8] = b"/p2pos/peer-exchange/1.0.0";

/// Every ALPN this node serves.
pub const ALL_ALPNS: [&[u8]; 5] = [
    MEMBERSHIP_ALPN,
    MEMBERSHIP_PUSH_ALPN,
    HEARTBEAT_ALPN,
    STATUS_ALPN,
    PEER_EXCHANGE_ALPN,
];

/// A dialable peer: a peer id plus zero or more direct socket addresses.
///
/// The textual form is `<peer_id>` or `<peer_id>@host:port`; a bare id
/// relies on relay discovery. Candidates resolved from different seeds
/// that share a peer id are merged into one target with the union of
/// addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    /// The peer to dial.
    pub peer_id: PeerId,
    /// Known direct addresses, deduplicated.
    pub addrs: Vec<SocketAddr>,
}

impl DialTarget {
    /// A target with no direct addresses (relay only).
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
        }
    }

    /// Add an address, keeping the list deduplicated.
    pub fn merge_addr(&mut self, addr: SocketAddr) {
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => write!(f, "{}@{}", self.peer_id, addr),
            None => write!(f, "{}", self.peer_id),
        }
    }
}

impl FromStr for DialTarget {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (id_str, addr_str) = match s.split_once('@') {
            Some((id, addr)) => (id, Some(addr)),
            None => (s, None),
        };
        let peer_id: PeerId = id_str
            .parse()
            .map_err(|e| NetError::InvalidAddress(format!("{s:?}: {e}")))?;
        let mut target = DialTarget::new(peer_id);
        if let Some(addr) = addr_str {
            let socket: SocketAddr = addr
                .parse()
                .map_err(|e| NetError::InvalidAddress(format!("{s:?}: {e}")))?;
            target.merge_addr(socket);
        }
        Ok(target)
    }
}

/// Capability interface over the peer-addressed secure-channel transport.
///
/// Production code uses [`IrohTransport`]; protocol tests substitute a
/// mock. Streams are addressed by stable peer identifiers derived from
/// public keys; every operation takes a deadline.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// This node's peer id.
    fn local_peer_id(&self) -> PeerId;

    /// Peers with at least one live connection.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Whether the transport reports a live connection to `peer`.
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Establish a connection to a dial target.
    async fn dial(&self, target: &DialTarget, timeout: Duration) -> Result<(), NetError>;

    /// Open a bidirectional stream for `alpn`, send `body`, half-close,
    /// and read the response to EOF.
    async fn request(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, NetError>;

    /// Open a uni-directional stream for `alpn` and send `body`. No
    /// response is read.
    async fn notify(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
        body: &[u8],
        timeout: Duration,
    ) -> Result<(), NetError>;

    /// Close the transport, unblocking all streams.
    async fn close(&self);
}
