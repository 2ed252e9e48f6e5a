//! Transport implementation on iroh QUIC.
//!
//! One endpoint serves every protocol; outgoing connections are pooled
//! per `(peer, protocol)` and checked with `close_reason()` before reuse.
//! Peer identifiers are the ed25519 public keys behind the iroh endpoint
//! ids, so no extra handshake is needed to authenticate a stream's remote
//! peer.

use std::collections::HashMap;
use std::time::Duration;

use iroh::endpoint::Connection;
use iroh::{Endpoint, NodeAddr, NodeId, RelayMode, SecretKey};
use p2pos_types::PeerId;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::debug;

use crate::error::NetError;
use crate::registry::ConnectionRegistry;
use crate::{ALL_ALPNS, DialTarget, MEMBERSHIP_ALPN, Transport};

/// Upper bound for any single JSON payload read to EOF.
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Network transport for inter-node communication.
pub struct IrohTransport {
    endpoint: Endpoint,
    local: PeerId,
    registry: ConnectionRegistry,
    /// Cached outgoing connections, keyed by peer and protocol.
    connections: RwLock<HashMap<(PeerId, &'static [u8]), Connection>>,
    /// Direct addresses learned from dial targets.
    addresses: RwLock<HashMap<PeerId, NodeAddr>>,
}

impl IrohTransport {
    /// Bind an endpoint for the given 32-byte key seed.
    ///
    /// `relay` controls whether the transport uses the public relay
    /// infrastructure (the `network_mode` decision).
    pub async fn bind(
        seed: [u8; 32],
        relay: bool,
        registry: ConnectionRegistry,
    ) -> Result<Self, NetError> {
        let secret_key = SecretKey::from_bytes(&seed);
        let relay_mode = if relay {
            RelayMode::Default
        } else {
            RelayMode::Disabled
        };
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(ALL_ALPNS.iter().map(|a| a.to_vec()).collect())
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        Ok(Self::from_endpoint(endpoint, registry))
    }

    /// Wrap an existing endpoint (the daemon builds the endpoint itself
    /// so it can hand it to the protocol router).
    pub fn from_endpoint(endpoint: Endpoint, registry: ConnectionRegistry) -> Self {
        let local = PeerId::from(*endpoint.node_id().as_bytes());
        Self {
            endpoint,
            local,
            registry,
            connections: RwLock::new(HashMap::new()),
            addresses: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The shared connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get or establish a connection to `peer` for `alpn`.
    async fn get_connection(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
    ) -> Result<Connection, NetError> {
        {
            let cache = self.connections.read().await;
            if let Some(conn) = cache.get(&(*peer, alpn))
                && conn.close_reason().is_none()
            {
                return Ok(conn.clone());
            }
        }

        // Prefer a learned direct address; fall back to the public key
        // alone and let iroh discovery do the rest.
        let addr = {
            let addresses = self.addresses.read().await;
            match addresses.get(peer) {
                Some(addr) => addr.clone(),
                None => {
                    let eid = NodeId::from_bytes(peer.as_bytes())
                        .map_err(|e| NetError::InvalidAddress(e.to_string()))?;
                    NodeAddr::new(eid)
                }
            }
        };

        debug!(peer = %peer.fmt_short(), alpn = %String::from_utf8_lossy(alpn), "connecting");
        let conn = self
            .endpoint
            .connect(addr.clone(), alpn)
            .await
            .map_err(NetError::from_connect)?;

        track_connection(&self.registry, *peer, addr_string(&addr), &conn);
        self.connections
            .write()
            .await
            .insert((*peer, alpn), conn.clone());
        Ok(conn)
    }
}

#[async_trait::async_trait]
impl Transport for IrohTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.registry.connected_peers()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.registry.is_connected(peer)
    }

    async fn dial(&self, target: &DialTarget, deadline: Duration) -> Result<(), NetError> {
        let eid = NodeId::from_bytes(target.peer_id.as_bytes())
            .map_err(|e| NetError::InvalidAddress(e.to_string()))?;
        let addr = NodeAddr::new(eid).with_direct_addresses(target.addrs.iter().copied());
        self.addresses.write().await.insert(target.peer_id, addr);

        timeout(deadline, self.get_connection(&target.peer_id, MEMBERSHIP_ALPN))
            .await
            .map_err(|_| NetError::Timeout("dial"))??;
        Ok(())
    }

    async fn request(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
        body: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, NetError> {
        timeout(deadline, async {
            let conn = self.get_connection(peer, alpn).await?;
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| NetError::StreamOpen(e.to_string()))?;
            send.write_all(body).await?;
            send.finish()?;
            let payload = recv.read_to_end(MAX_PAYLOAD_SIZE).await?;
            Ok(payload)
        })
        .await
        .map_err(|_| NetError::Timeout("request"))?
    }

    async fn notify(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
        body: &[u8],
        deadline: Duration,
    ) -> Result<(), NetError> {
        timeout(deadline, async {
            let conn = self.get_connection(peer, alpn).await?;
            let mut send = conn
                .open_uni()
                .await
                .map_err(|e| NetError::StreamOpen(e.to_string()))?;
            send.write_all(body).await?;
            send.finish()?;
            Ok(())
        })
        .await
        .map_err(|_| NetError::Timeout("notify"))?
    }

    async fn close(&self) {
        self.endpoint.close().await;
    }
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Register `conn` for `peer` and release it when the connection closes.
///
/// Used for outgoing connections here and for accepted connections by the
/// protocol handlers.
pub fn track_connection(
    registry: &ConnectionRegistry,
    peer: PeerId,
    remote_addr: String,
    conn: &Connection,
) {
    let guard = registry.register(peer, remote_addr);
    let conn = conn.clone();
    tokio::spawn(async move {
        let _ = conn.closed().await;
        drop(guard);
    });
}

/// Best-effort textual form of an endpoint address for peer rows.
fn addr_string(addr: &NodeAddr) -> String {
    addr.direct_addresses()
        .next()
        .map(|socket| socket.to_string())
        .unwrap_or_default()
}
