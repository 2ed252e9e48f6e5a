//! Inbound protocol handlers for the iroh router.
//!
//! One handler per ALPN. Every accepted connection goes through
//! [`Admission`] first: when the runtime has left `unconfigured` and the
//! remote is not a current member, the connection is closed on the spot.
//! Business protocols (heartbeat, status, peer exchange) are additionally
//! refused while `unconfigured`; membership fetch/push stay open so a
//! push can configure us.

use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use p2pos_cluster::RuntimeStateMachine;
use p2pos_net::message;
use p2pos_net::{ConnectionRegistry, track_connection};
use p2pos_types::PeerId;
use tracing::{debug, warn};

use crate::heartbeat::HeartbeatService;
use crate::membership::MembershipService;
use crate::peer_exchange::PeerExchangeService;
use crate::status::StatusService;

/// Upper bound for an inbound JSON payload.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Connection-level admission shared by all handlers.
#[derive(Clone)]
pub struct Admission {
    runtime: Arc<RuntimeStateMachine>,
    registry: ConnectionRegistry,
}

impl Admission {
    /// Build the gate.
    pub fn new(runtime: Arc<RuntimeStateMachine>, registry: ConnectionRegistry) -> Self {
        Self { runtime, registry }
    }

    /// Admit or close an accepted connection.
    ///
    /// On admission the connection is tracked in the registry (emitting
    /// the connect event) and the remote peer id is returned.
    fn admit(&self, conn: &Connection, business: bool) -> Option<PeerId> {
        let Ok(remote_node_id) = conn.remote_node_id() else {
            return None;
        };
        let peer = PeerId::from(*remote_node_id.as_bytes());
        if !self.runtime.allow_peer(&peer) {
            warn!(
                peer = %peer.fmt_short(),
                state = %self.runtime.state(),
                "rejecting connection from non-member"
            );
            conn.close(0u32.into(), b"not a cluster member");
            return None;
        }
        if business && !self.runtime.can_use_business_protocols() {
            debug!(peer = %peer.fmt_short(), "refusing business protocol while unconfigured");
            conn.close(0u32.into(), b"node is unconfigured");
            return None;
        }
        track_connection(&self.registry, peer, String::new(), conn);
        Some(peer)
    }

    fn last_addr(&self, peer: &PeerId) -> String {
        self.registry.last_addr(peer)
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Membership fetch
// ---------------------------------------------------------------------------

/// Serves `/p2pos/membership/1.0.0`.
#[derive(Debug)]
pub struct MembershipFetchHandler {
    /// The membership service answering fetches.
    pub service: Arc<MembershipService>,
    /// The shared admission gate.
    pub admission: Admission,
}

impl ProtocolHandler for MembershipFetchHandler {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let Some(_peer) = self.admission.admit(&conn, false) else {
            return Ok(());
        };
        let service = self.service.clone();
        tokio::spawn(async move {
            while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                // Fetch carries no request body; drain to EOF regardless.
                let _ = recv.read_to_end(MAX_REQUEST_SIZE).await;
                let resp = message::encode(&service.handle_fetch());
                if send.write_all(&resp).await.is_err() {
                    break;
                }
                let _ = send.finish();
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Membership push
// ---------------------------------------------------------------------------

/// Serves `/p2pos/membership-push/1.0.0`.
#[derive(Debug)]
pub struct MembershipPushHandler {
    /// The membership service applying pushes.
    pub service: Arc<MembershipService>,
    /// The shared admission gate.
    pub admission: Admission,
}

impl ProtocolHandler for MembershipPushHandler {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let Some(peer) = self.admission.admit(&conn, false) else {
            return Ok(());
        };
        let service = self.service.clone();
        tokio::spawn(async move {
            while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                let Ok(body) = recv.read_to_end(MAX_REQUEST_SIZE).await else {
                    break;
                };
                let (resp, fanout) = service.handle_push(peer, &body);
                if send.write_all(&message::encode(&resp)).await.is_err() {
                    break;
                }
                let _ = send.finish();
                // Response first, then the one-hop fanout.
                if let Some(snapshot) = fanout {
                    service.fanout(peer, &snapshot).await;
                }
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Serves `/p2pos/heartbeat/1.0.0` (uni-directional).
#[derive(Debug)]
pub struct HeartbeatHandler {
    /// The heartbeat service validating beacons.
    pub service: Arc<HeartbeatService>,
    /// The shared admission gate.
    pub admission: Admission,
}

impl ProtocolHandler for HeartbeatHandler {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let Some(peer) = self.admission.admit(&conn, true) else {
            return Ok(());
        };
        let service = self.service.clone();
        let remote_addr = self.admission.last_addr(&peer);
        tokio::spawn(async move {
            while let Ok(mut recv) = conn.accept_uni().await {
                let Ok(body) = recv.read_to_end(MAX_REQUEST_SIZE).await else {
                    break;
                };
                service.handle(remote_addr.clone(), &body);
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Serves `/p2pos/status/1.0.0`.
///
/// Admitted even while `unconfigured`: the response then carries
/// `error = "node is unconfigured"` instead of rows.
#[derive(Debug)]
pub struct StatusHandler {
    /// The status service answering queries.
    pub service: Arc<StatusService>,
    /// The shared admission gate.
    pub admission: Admission,
}

impl ProtocolHandler for StatusHandler {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let Some(_peer) = self.admission.admit(&conn, false) else {
            return Ok(());
        };
        let service = self.service.clone();
        tokio::spawn(async move {
            while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                let Ok(body) = recv.read_to_end(MAX_REQUEST_SIZE).await else {
                    break;
                };
                let resp = service.handle(&body).await;
                if send.write_all(&message::encode(&resp)).await.is_err() {
                    break;
                }
                let _ = send.finish();
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Peer exchange
// ---------------------------------------------------------------------------

/// Serves `/p2pos/peer-exchange/1.0.0`.
#[derive(Debug)]
pub struct PeerExchangeHandler {
    /// The peer-exchange service answering queries.
    pub service: Arc<PeerExchangeService>,
    /// The shared admission gate.
    pub admission: Admission,
}

impl ProtocolHandler for PeerExchangeHandler {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let Some(_peer) = self.admission.admit(&conn, true) else {
            return Ok(());
        };
        let service = self.service.clone();
        tokio::spawn(async move {
            while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                let _ = recv.read_to_end(MAX_REQUEST_SIZE).await;
                let resp = message::encode(&service.handle());
                if send.write_all(&resp).await.is_err() {
                    break;
                }
                let _ = send.finish();
            }
        });
        Ok(())
    }
}
