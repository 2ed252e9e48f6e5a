//! Signed heartbeats: the presence beacon between member peers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use p2pos_cluster::{MembershipManager, NodeKey, RuntimeStateMachine, verify_from_peer};
use p2pos_net::message::{self, HeartbeatMessage};
use p2pos_net::{HEARTBEAT_ALPN, Transport};
use p2pos_types::events::{EventBus, PeerHeartbeat};
use p2pos_types::{PeerId, SharedClock, rfc3339_nanos};
use tracing::{debug, info, warn};

use crate::marks::UnsupportedMarks;

/// How often heartbeats are emitted to member peers.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a single heartbeat stream.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepted clock skew between sender and receiver.
const HEARTBEAT_WINDOW_SECS: i64 = 5 * 60;

/// Reasons a heartbeat is dropped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeartbeatError {
    /// One of `peer_id`, `ts`, `sig` is empty.
    #[error("missing fields")]
    MissingFields,
    /// The sender is not a current member.
    #[error("peer not a member")]
    NotAMember,
    /// Sender and receiver disagree on the cluster.
    #[error("cluster_id mismatch")]
    ClusterMismatch,
    /// `ts` is not a parseable RFC3339 timestamp.
    #[error("invalid timestamp")]
    InvalidTimestamp,
    /// `ts` is more than five minutes away from local UTC.
    #[error("timestamp out of window")]
    OutOfWindow,
    /// The signature does not verify against the sender's key.
    #[error("signature invalid")]
    SignatureInvalid,
}

/// Emits and validates heartbeats.
pub struct HeartbeatService {
    manager: Arc<MembershipManager>,
    runtime: Arc<RuntimeStateMachine>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    clock: SharedClock,
    node_key: NodeKey,
    unsupported: UnsupportedMarks,
}

impl HeartbeatService {
    /// Wire up the service.
    pub fn new(
        manager: Arc<MembershipManager>,
        runtime: Arc<RuntimeStateMachine>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        clock: SharedClock,
        node_key: NodeKey,
    ) -> Self {
        Self {
            manager,
            runtime,
            transport,
            bus,
            clock,
            node_key,
            unsupported: UnsupportedMarks::new(),
        }
    }

    /// The per-peer unsupported marks (cleared on connect events).
    pub fn unsupported(&self) -> &UnsupportedMarks {
        &self.unsupported
    }

    /// Canonical signing bytes: `cluster_id|peer_id|ts`.
    fn canonical(cluster_id: &str, peer: &PeerId, ts: DateTime<Utc>) -> Vec<u8> {
        format!("{cluster_id}|{peer}|{}", rfc3339_nanos(ts)).into_bytes()
    }

    /// Build a signed heartbeat for the current instant.
    pub fn build_message(&self) -> HeartbeatMessage {
        let cluster_id = self.manager.cluster_id().to_string();
        let peer_id = self.transport.local_peer_id();
        let ts = self.clock.now_utc();
        let sig = self
            .node_key
            .sign_b64(&Self::canonical(&cluster_id, &peer_id, ts));
        HeartbeatMessage {
            cluster_id,
            peer_id,
            ts: rfc3339_nanos(ts),
            sig,
        }
    }

    /// One broadcast round: send to every connected member peer that is
    /// not marked unsupported, with a 5-second deadline each.
    pub async fn broadcast(&self) {
        if !self.runtime.can_use_business_protocols() {
            return;
        }

        let bytes = message::encode(&self.build_message());
        for peer in self.transport.connected_peers() {
            if !self.manager.is_member(&peer) {
                continue;
            }
            if self.unsupported.contains(&peer) {
                continue;
            }
            match self
                .transport
                .notify(&peer, HEARTBEAT_ALPN, &bytes, SEND_TIMEOUT)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_protocol_unsupported() => {
                    info!(peer = %peer.fmt_short(), "heartbeat protocol unsupported, marking peer");
                    self.unsupported.mark(peer);
                }
                Err(err) => {
                    debug!(peer = %peer.fmt_short(), %err, "heartbeat send failed");
                }
            }
        }
    }

    /// Validate an inbound heartbeat. Returns the parsed timestamp.
    pub fn validate(&self, msg: &HeartbeatMessage) -> Result<DateTime<Utc>, HeartbeatError> {
        if msg.ts.is_empty() || msg.sig.is_empty() {
            return Err(HeartbeatError::MissingFields);
        }
        if !self.manager.is_member(&msg.peer_id) {
            return Err(HeartbeatError::NotAMember);
        }
        let cluster_id = self.manager.cluster_id();
        if !cluster_id.is_empty() && !msg.cluster_id.is_empty() && msg.cluster_id != cluster_id {
            return Err(HeartbeatError::ClusterMismatch);
        }

        let ts = DateTime::parse_from_rfc3339(&msg.ts)
            .map_err(|_| HeartbeatError::InvalidTimestamp)?
            .with_timezone(&Utc);
        let now = self.clock.now_utc();
        let skew = (now - ts).num_seconds().abs();
        if skew > HEARTBEAT_WINDOW_SECS {
            return Err(HeartbeatError::OutOfWindow);
        }

        let payload = Self::canonical(cluster_id, &msg.peer_id, ts);
        verify_from_peer(&msg.peer_id, &payload, &msg.sig)
            .map_err(|_| HeartbeatError::SignatureInvalid)?;
        Ok(ts)
    }

    /// Handle one inbound heartbeat stream. Violations are dropped and
    /// logged; a valid heartbeat feeds presence.
    pub fn handle(&self, remote_addr: String, body: &[u8]) {
        if !self.runtime.can_use_business_protocols() {
            return;
        }
        let msg: HeartbeatMessage = match message::decode(body) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "heartbeat decode failed");
                return;
            }
        };
        if let Err(reason) = self.validate(&msg) {
            warn!(peer = %msg.peer_id.fmt_short(), %reason, "heartbeat rejected");
            return;
        }
        self.bus.emit(PeerHeartbeat {
            peer_id: msg.peer_id,
            remote_addr,
            at: self.clock.now_utc(),
        });
    }
}

impl std::fmt::Debug for HeartbeatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatService")
            .field("cluster_id", &self.manager.cluster_id())
            .finish_non_exhaustive()
    }
}
