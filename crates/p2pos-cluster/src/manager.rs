//! The membership manager: holds the current signed snapshot, validates
//! and monotonically applies new ones, and answers membership queries.
//!
//! A reader–writer lock guards the snapshot; [`apply`](MembershipManager::apply)
//! takes the writer, queries take the reader. Concurrent callers observe
//! either the prior or the new snapshot, never an in-between state.

use std::collections::BTreeSet;
use std::sync::RwLock;

use p2pos_types::{PeerId, SharedClock};

use crate::error::ClusterError;
use crate::identity::SystemKey;
use crate::proof::AdminProof;
use crate::snapshot::{Snapshot, normalize_members};

/// Outcome of a successful [`MembershipManager::apply`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The snapshot was strictly newer and replaced the stored one.
    Applied,
    /// The snapshot validated but was not newer; the stored one is kept.
    /// A no-op, not an error.
    Stale,
}

/// Member counts evaluated atomically under the manager's read lock,
/// consumed by the runtime state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumView {
    /// Whether the local peer appears in the current member set.
    pub local_is_member: bool,
    /// `N`: cardinality of the current member set.
    pub member_count: usize,
    /// `k`: the local node plus every connected peer that is a member.
    pub online: usize,
}

struct Inner {
    snapshot: Snapshot,
    member_set: BTreeSet<PeerId>,
}

/// Holds and guards the authoritative membership state of this node.
pub struct MembershipManager {
    cluster_id: String,
    local_peer: PeerId,
    system_key: Option<SystemKey>,
    clock: SharedClock,
    inner: RwLock<Inner>,
}

impl MembershipManager {
    /// Build the manager from configuration.
    ///
    /// `cluster_id` is trimmed and defaults to `"default"` when empty.
    /// When `system_pubkey` is configured, every applied snapshot must
    /// carry an admin proof that verifies against it.
    pub fn new(
        cluster_id: &str,
        system_pubkey: Option<&str>,
        local_peer: PeerId,
        initial_members: Vec<PeerId>,
        clock: SharedClock,
    ) -> Result<Self, ClusterError> {
        let cluster_id = {
            let trimmed = cluster_id.trim();
            if trimmed.is_empty() {
                "default".to_string()
            } else {
                trimmed.to_string()
            }
        };

        let system_key = match system_pubkey.map(str::trim) {
            Some(key) if !key.is_empty() => Some(SystemKey::from_base64(key)?),
            _ => None,
        };

        let members = normalize_members(initial_members);
        let member_set: BTreeSet<PeerId> = members.iter().copied().collect();
        let snapshot = Snapshot {
            cluster_id: cluster_id.clone(),
            members,
            ..Snapshot::default()
        };

        Ok(Self {
            cluster_id,
            local_peer,
            system_key,
            clock,
            inner: RwLock::new(Inner {
                snapshot,
                member_set,
            }),
        })
    }

    /// The local cluster id.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// This node's peer id.
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Whether a system public key is configured.
    pub fn has_system_key(&self) -> bool {
        self.system_key.is_some()
    }

    /// Whether the current member set is non-empty.
    pub fn has_members(&self) -> bool {
        !self.inner.read().expect("manager lock").member_set.is_empty()
    }

    /// Whether `peer` appears in the current member set.
    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.inner
            .read()
            .expect("manager lock")
            .member_set
            .contains(peer)
    }

    /// A copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().expect("manager lock").snapshot.clone()
    }

    /// Compute the quorum inputs in one critical section: `N`, `k`
    /// (self plus connected members) and local membership.
    pub fn quorum_view(&self, connected: &[PeerId]) -> QuorumView {
        let inner = self.inner.read().expect("manager lock");
        let online = 1 + connected
            .iter()
            .filter(|p| inner.member_set.contains(p))
            .count();
        QuorumView {
            local_is_member: inner.member_set.contains(&self.local_peer),
            member_count: inner.member_set.len(),
            online,
        }
    }

    /// Validate a snapshot and, if strictly newer, replace the stored one.
    ///
    /// Validation order: cluster id, `issued_at` present, members
    /// non-empty, issuer present, signature, admin proof (when a system
    /// key is configured). A snapshot that validates but is not newer
    /// returns [`Applied::Stale`] without touching the stored state.
    pub fn apply(&self, mut snapshot: Snapshot) -> Result<Applied, ClusterError> {
        snapshot.members = normalize_members(snapshot.members);
        self.validate(&snapshot)?;

        let mut inner = self.inner.write().expect("manager lock");
        let current = inner.snapshot.issued_at;
        if snapshot.issued_at <= current {
            return Ok(Applied::Stale);
        }

        inner.member_set = snapshot.members.iter().copied().collect();
        inner.snapshot = snapshot;
        Ok(Applied::Applied)
    }

    fn validate(&self, snapshot: &Snapshot) -> Result<(), ClusterError> {
        if snapshot.cluster_id.trim() != self.cluster_id {
            return Err(ClusterError::ClusterMismatch);
        }
        if snapshot.issued_at.is_none() {
            return Err(ClusterError::MissingField("issued_at"));
        }
        if snapshot.members.is_empty() {
            return Err(ClusterError::MissingField("members"));
        }
        let issuer = snapshot
            .issuer_peer_id
            .ok_or(ClusterError::MissingField("issuer_peer_id"))?;
        if snapshot.sig.trim().is_empty() {
            return Err(ClusterError::MissingField("sig"));
        }
        snapshot.verify_signature()?;

        if self.system_key.is_some() {
            let proof = snapshot
                .admin_proof
                .as_ref()
                .ok_or(ClusterError::MissingField("admin_proof"))?;
            self.validate_admin_proof(proof, &issuer)?;
        }
        Ok(())
    }

    /// Validate an admin proof against the configured system key for a
    /// given issuer. Errors when no system key is configured.
    pub fn validate_admin_proof(
        &self,
        proof: &AdminProof,
        expected_issuer: &PeerId,
    ) -> Result<(), ClusterError> {
        let system = self
            .system_key
            .as_ref()
            .ok_or(ClusterError::SystemKeyRequired)?;
        proof.validate(
            &self.cluster_id,
            expected_issuer,
            system,
            self.clock.now_utc(),
        )
    }
}

impl std::fmt::Debug for MembershipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipManager")
            .field("cluster_id", &self.cluster_id)
            .field("local_peer", &self.local_peer)
            .field("has_system_key", &self.system_key.is_some())
            .finish_non_exhaustive()
    }
}
