//! Administrator proof: a time-bounded, system-signed capability binding
//! one peer id to the `admin` role.
//!
//! The system private key never resides on a running node; what a node
//! sees is this proof, carried inside snapshots and verified against the
//! configured [`SystemKey`]. Expiry blocks the issuance of *new* snapshots
//! but does not invalidate snapshots already propagated.

use chrono::{DateTime, Utc};
use p2pos_types::{PeerId, rfc3339_nanos};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::identity::{NodeKey, SystemKey};

/// The only role an admin proof may carry.
pub const ADMIN_ROLE: &str = "admin";

/// A signed administrator credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminProof {
    /// Cluster the credential is scoped to.
    pub cluster_id: String,
    /// The administrator's node id.
    pub peer_id: PeerId,
    /// Must equal [`ADMIN_ROLE`].
    pub role: String,
    /// Start of the validity window (UTC, inclusive).
    pub valid_from: DateTime<Utc>,
    /// End of the validity window (UTC, inclusive).
    pub valid_to: DateTime<Utc>,
    /// Base64 signature by the system private key over
    /// [`canonical_bytes`](Self::canonical_bytes).
    #[serde(default)]
    pub sig: String,
}

impl AdminProof {
    /// Canonical signing bytes:
    /// `cluster_id|peer_id|role|valid_from|valid_to`, timestamps in
    /// RFC3339 with nanosecond precision, UTC.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}",
            self.cluster_id,
            self.peer_id,
            self.role,
            rfc3339_nanos(self.valid_from),
            rfc3339_nanos(self.valid_to),
        )
        .into_bytes()
    }

    /// Build and sign a proof with the system private key (keygen only).
    pub fn issue(
        cluster_id: &str,
        peer_id: PeerId,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        system_priv: &NodeKey,
    ) -> Self {
        let mut proof = Self {
            cluster_id: cluster_id.to_string(),
            peer_id,
            role: ADMIN_ROLE.to_string(),
            valid_from,
            valid_to,
            sig: String::new(),
        };
        proof.sig = system_priv.sign_b64(&proof.canonical_bytes());
        proof
    }

    /// Validate this proof for a given issuer at a given instant.
    ///
    /// Checks, in order: role, cluster, issuer binding, validity window,
    /// signature against the system key.
    pub fn validate(
        &self,
        cluster_id: &str,
        expected_issuer: &PeerId,
        system: &SystemKey,
        now: DateTime<Utc>,
    ) -> Result<(), ClusterError> {
        if self.role != ADMIN_ROLE {
            return Err(ClusterError::ProofRole);
        }
        if self.cluster_id != cluster_id {
            return Err(ClusterError::ProofClusterMismatch);
        }
        if &self.peer_id != expected_issuer {
            return Err(ClusterError::ProofPeerMismatch);
        }
        if now < self.valid_from || now > self.valid_to {
            return Err(ClusterError::ProofOutsideValidity);
        }
        system.verify(&self.canonical_bytes(), &self.sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn setup() -> (NodeKey, SystemKey, NodeKey, DateTime<Utc>) {
        let system_priv = NodeKey::generate();
        let system_pub = SystemKey::from_base64(&system_priv.public_base64()).unwrap();
        let admin = NodeKey::generate();
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 11, 0, 0).unwrap();
        (system_priv, system_pub, admin, now)
    }

    #[test]
    fn test_issue_and_validate() {
        let (system_priv, system_pub, admin, now) = setup();
        let proof = AdminProof::issue(
            "default",
            admin.peer_id(),
            now - Duration::hours(1),
            now + Duration::hours(1),
            &system_priv,
        );
        proof
            .validate("default", &admin.peer_id(), &system_pub, now)
            .unwrap();
    }

    #[test]
    fn test_canonical_bytes_layout() {
        let (system_priv, _, admin, now) = setup();
        let proof = AdminProof::issue("c1", admin.peer_id(), now, now, &system_priv);
        let canonical = String::from_utf8(proof.canonical_bytes()).unwrap();
        assert_eq!(
            canonical,
            format!(
                "c1|{}|admin|{}|{}",
                admin.peer_id(),
                rfc3339_nanos(now),
                rfc3339_nanos(now)
            )
        );
    }

    #[test]
    fn test_rejects_wrong_role() {
        let (system_priv, system_pub, admin, now) = setup();
        let mut proof = AdminProof::issue("default", admin.peer_id(), now, now, &system_priv);
        proof.role = "operator".to_string();
        assert!(matches!(
            proof.validate("default", &admin.peer_id(), &system_pub, now),
            Err(ClusterError::ProofRole)
        ));
    }

    #[test]
    fn test_rejects_cluster_mismatch() {
        let (system_priv, system_pub, admin, now) = setup();
        let proof = AdminProof::issue("other", admin.peer_id(), now, now, &system_priv);
        assert!(matches!(
            proof.validate("default", &admin.peer_id(), &system_pub, now),
            Err(ClusterError::ProofClusterMismatch)
        ));
    }

    #[test]
    fn test_rejects_peer_mismatch() {
        let (system_priv, system_pub, admin, now) = setup();
        let proof = AdminProof::issue("default", admin.peer_id(), now, now, &system_priv);
        let somebody_else = NodeKey::generate().peer_id();
        assert!(matches!(
            proof.validate("default", &somebody_else, &system_pub, now),
            Err(ClusterError::ProofPeerMismatch)
        ));
    }

    #[test]
    fn test_rejects_outside_validity_window() {
        let (system_priv, system_pub, admin, now) = setup();
        let proof = AdminProof::issue(
            "default",
            admin.peer_id(),
            now - Duration::hours(2),
            now - Duration::hours(1),
            &system_priv,
        );
        assert!(matches!(
            proof.validate("default", &admin.peer_id(), &system_pub, now),
            Err(ClusterError::ProofOutsideValidity)
        ));

        let not_yet = AdminProof::issue(
            "default",
            admin.peer_id(),
            now + Duration::hours(1),
            now + Duration::hours(2),
            &system_priv,
        );
        assert!(matches!(
            not_yet.validate("default", &admin.peer_id(), &system_pub, now),
            Err(ClusterError::ProofOutsideValidity)
        ));
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let (system_priv, system_pub, admin, now) = setup();
        let proof = AdminProof::issue("default", admin.peer_id(), now, now, &system_priv);
        proof
            .validate("default", &admin.peer_id(), &system_pub, now)
            .unwrap();
    }

    #[test]
    fn test_rejects_forged_signature() {
        let (_, system_pub, admin, now) = setup();
        let rogue_system = NodeKey::generate();
        let proof = AdminProof::issue("default", admin.peer_id(), now, now, &rogue_system);
        assert!(matches!(
            proof.validate("default", &admin.peer_id(), &system_pub, now),
            Err(ClusterError::ProofSignatureInvalid)
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let (system_priv, _, admin, now) = setup();
        let proof = AdminProof::issue("default", admin.peer_id(), now, now, &system_priv);
        let json = serde_json::to_string(&proof).unwrap();
        let back: AdminProof = serde_json::from_str(&json).unwrap();
        assert_eq!(back, proof);
    }
}
