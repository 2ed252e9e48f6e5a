//! The membership protocol: fetch, push with one-hop fanout, periodic
//! pull and administrator publish.
//!
//! The issuer check on fanout is the system's only anti-amplification
//! measure: a snapshot is forwarded exactly once, and only when the
//! stream's remote peer is the snapshot's issuer.

use std::sync::Arc;
use std::time::Duration;

use p2pos_cluster::{
    Applied, MembershipManager, RuntimeStateMachine, Snapshot, normalize_members, sign_snapshot,
};
use p2pos_cluster::{AdminProof, NodeKey};
use p2pos_net::message::{self, FetchResponse, PushResponse};
use p2pos_net::{MEMBERSHIP_ALPN, MEMBERSHIP_PUSH_ALPN, NetError, Transport};
use p2pos_types::events::{EventBus, MembershipApplied};
use p2pos_types::{PeerId, SharedClock};
use tracing::{debug, info, warn};

use crate::error::NodeError;

/// How often the pull task asks connected peers for their snapshot.
pub const MEMBERSHIP_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a single fetch stream.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for a single push stream.
const PUSH_TIMEOUT: Duration = Duration::from_secs(8);

/// Serves and consumes membership snapshots.
pub struct MembershipService {
    manager: Arc<MembershipManager>,
    runtime: Arc<RuntimeStateMachine>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    clock: SharedClock,
    node_key: NodeKey,
    admin_proof: Option<AdminProof>,
}

impl MembershipService {
    /// Wire up the service. `admin_proof` is the locally configured
    /// credential, present only on administrator nodes.
    pub fn new(
        manager: Arc<MembershipManager>,
        runtime: Arc<RuntimeStateMachine>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        clock: SharedClock,
        node_key: NodeKey,
        admin_proof: Option<AdminProof>,
    ) -> Self {
        Self {
            manager,
            runtime,
            transport,
            bus,
            clock,
            node_key,
            admin_proof,
        }
    }

    /// The membership manager backing this service.
    pub fn manager(&self) -> &Arc<MembershipManager> {
        &self.manager
    }

    // -------------------------------------------------------------------
    // Responder side
    // -------------------------------------------------------------------

    /// Answer a fetch stream with the current snapshot.
    pub fn handle_fetch(&self) -> FetchResponse {
        let snapshot = self.manager.snapshot();
        if snapshot.issued_at.is_none() && snapshot.members.is_empty() {
            return FetchResponse {
                snapshot: Snapshot::default(),
                error: Some("membership not initialized".to_string()),
            };
        }
        FetchResponse {
            snapshot,
            error: None,
        }
    }

    /// Accept a pushed snapshot from `remote`.
    ///
    /// Returns the response to write back plus, when the apply advanced
    /// the stored `issued_at` **and** the pusher is the snapshot's
    /// issuer, the snapshot to fan out one hop.
    pub fn handle_push(&self, remote: PeerId, body: &[u8]) -> (PushResponse, Option<Snapshot>) {
        let snapshot: Snapshot = match message::decode(body) {
            Ok(snapshot) => snapshot,
            Err(_) => {
                return (
                    PushResponse {
                        applied: false,
                        error: Some("decode failed".to_string()),
                    },
                    None,
                );
            }
        };

        let issuer = snapshot.issuer_peer_id;
        match self.apply_reported(snapshot.clone(), &remote) {
            Err(err) => (
                PushResponse {
                    applied: false,
                    error: Some(err.to_string()),
                },
                None,
            ),
            Ok(applied) => {
                self.runtime
                    .evaluate(&self.transport.connected_peers(), "membership-push");

                // One hop only: the issuer check stops relay loops.
                let fanout = (applied == Applied::Applied && issuer == Some(remote))
                    .then_some(snapshot);
                (
                    PushResponse {
                        applied: true,
                        error: None,
                    },
                    fanout,
                )
            }
        }
    }

    // -------------------------------------------------------------------
    // Initiator side
    // -------------------------------------------------------------------

    /// Fetch the snapshot held by `peer`.
    pub async fn fetch_from(&self, peer: &PeerId) -> Result<Snapshot, NodeError> {
        let bytes = self
            .transport
            .request(peer, MEMBERSHIP_ALPN, b"", FETCH_TIMEOUT)
            .await?;
        let resp: FetchResponse = message::decode(&bytes)?;
        if let Some(err) = resp.error {
            return Err(NetError::Remote(err).into());
        }
        Ok(resp.snapshot)
    }

    /// Push a snapshot to `peer` and wait for its verdict.
    pub async fn push_to(&self, peer: &PeerId, snapshot: &Snapshot) -> Result<(), NodeError> {
        let bytes = self
            .transport
            .request(peer, MEMBERSHIP_PUSH_ALPN, &message::encode(snapshot), PUSH_TIMEOUT)
            .await?;
        let resp: PushResponse = message::decode(&bytes)?;
        if !resp.applied {
            let reason = resp.error.unwrap_or_else(|| "push rejected".to_string());
            return Err(NetError::Remote(reason).into());
        }
        Ok(())
    }

    /// One pull round: fetch from every connected peer and feed the
    /// results to the manager. Errors are logged and skipped; an invalid
    /// snapshot from one peer never prevents applying a valid one from
    /// another.
    pub async fn sync_once(&self) {
        for peer in self.transport.connected_peers() {
            let snapshot = match self.fetch_from(&peer).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    debug!(peer = %peer.fmt_short(), %err, "membership fetch failed");
                    continue;
                }
            };
            // Uninitialized responders answer unsigned snapshots.
            if snapshot.sig.is_empty() || snapshot.issuer_peer_id.is_none() {
                continue;
            }
            let _ = self.apply_reported(snapshot, &peer);
        }
        self.runtime
            .evaluate(&self.transport.connected_peers(), "membership-sync");
    }

    /// Forward `snapshot` to every connected peer except `source`.
    pub async fn fanout(&self, source: PeerId, snapshot: &Snapshot) {
        for peer in self.transport.connected_peers() {
            if peer == source {
                continue;
            }
            if let Err(err) = self.push_to(&peer, snapshot).await {
                warn!(peer = %peer.fmt_short(), %err, "snapshot fanout failed");
            }
        }
    }

    /// Administrator publish: build, sign, apply locally, push to every
    /// connected peer.
    ///
    /// Gates, in order: runtime must be `healthy`, an admin proof must be
    /// configured and must still validate, the snapshot must sign and
    /// apply. The first failed gate is returned as a typed error.
    pub async fn publish(&self, members: Vec<PeerId>) -> Result<Snapshot, NodeError> {
        if !self.runtime.can_publish() {
            warn!(state = %self.runtime.state(), "membership publish denied");
            return Err(NodeError::NotHealthy);
        }
        let proof = self.admin_proof.as_ref().ok_or(NodeError::NoAdminProof)?;
        self.manager.validate_admin_proof(proof, &proof.peer_id)?;

        let snapshot = sign_snapshot(
            &self.node_key,
            Snapshot {
                cluster_id: self.manager.cluster_id().to_string(),
                issued_at: Some(self.clock.now_utc()),
                issuer_peer_id: Some(self.transport.local_peer_id()),
                members: normalize_members(members),
                admin_proof: Some(proof.clone()),
                sig: String::new(),
            },
        )?;

        let local = self.transport.local_peer_id();
        self.apply_reported(snapshot.clone(), &local)?;
        self.runtime
            .evaluate(&self.transport.connected_peers(), "membership-set");

        for peer in self.transport.connected_peers() {
            if let Err(err) = self.push_to(&peer, &snapshot).await {
                warn!(peer = %peer.fmt_short(), %err, "snapshot push failed");
            }
        }
        Ok(snapshot)
    }

    // -------------------------------------------------------------------
    // Shared apply path
    // -------------------------------------------------------------------

    /// Apply a snapshot, log the outcome and emit
    /// [`MembershipApplied`] when the stored `issued_at` advanced.
    fn apply_reported(&self, snapshot: Snapshot, from: &PeerId) -> Result<Applied, NodeError> {
        match self.manager.apply(snapshot) {
            Ok(Applied::Applied) => {
                let stored = self.manager.snapshot();
                info!(
                    peer = %from.fmt_short(),
                    issued_at = ?stored.issued_at,
                    members = stored.members.len(),
                    "membership snapshot applied"
                );
                self.bus.emit(MembershipApplied {
                    cluster_id: stored.cluster_id.clone(),
                    issued_at: stored.issued_at.unwrap_or_default(),
                    members: stored.members.clone(),
                });
                Ok(Applied::Applied)
            }
            Ok(Applied::Stale) => Ok(Applied::Stale),
            Err(err) => {
                warn!(peer = %from.fmt_short(), reason = %err, "membership snapshot rejected");
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for MembershipService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipService")
            .field("cluster_id", &self.manager.cluster_id())
            .field("is_admin", &self.admin_proof.is_some())
            .finish_non_exhaustive()
    }
}
