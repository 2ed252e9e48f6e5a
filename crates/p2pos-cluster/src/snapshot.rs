//! Signed membership snapshots.
//!
//! A snapshot is the authoritative member list: issued by the
//! administrator, signed with the issuer's node key, and versioned by
//! `issued_at`. Member lists are deduplicated and sorted before both
//! signing and verification, so any ordering of the same set produces the
//! same canonical bytes.

use chrono::{DateTime, Utc};
use p2pos_types::{PeerId, rfc3339_nanos};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::identity::{NodeKey, verify_from_peer};
use crate::proof::AdminProof;

/// The signed, monotonically versioned member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    /// Cluster this snapshot belongs to.
    #[serde(default)]
    pub cluster_id: String,
    /// Issue timestamp (UTC). Absent only in the unsigned initial state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    /// The administrator node that issued and signed the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_peer_id: Option<PeerId>,
    /// The authoritative member set.
    #[serde(default)]
    pub members: Vec<PeerId>,
    /// The issuer's admin credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_proof: Option<AdminProof>,
    /// Base64 signature by the issuer's node key over
    /// [`canonical_bytes`](Self::canonical_bytes).
    #[serde(default)]
    pub sig: String,
}

impl Snapshot {
    /// Canonical signing bytes:
    /// `cluster_id|issued_at|issuer_peer_id|M` where `M` is the
    /// deduplicated, sorted member list joined by `,`.
    ///
    /// Members are re-normalized here so the bytes are invariant under
    /// member ordering.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let members = normalize_members(self.members.clone());
        let joined = members
            .iter()
            .map(PeerId::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}|{}|{}|{}",
            self.cluster_id,
            self.issued_at.map(rfc3339_nanos).unwrap_or_default(),
            self.issuer_peer_id
                .map(|p| p.to_string())
                .unwrap_or_default(),
            joined,
        )
        .into_bytes()
    }

    /// Verify `sig` against the public key recoverable from
    /// `issuer_peer_id`.
    pub fn verify_signature(&self) -> Result<(), ClusterError> {
        let issuer = self
            .issuer_peer_id
            .as_ref()
            .ok_or(ClusterError::MissingField("issuer_peer_id"))?;
        verify_from_peer(issuer, &self.canonical_bytes(), &self.sig)
    }
}

/// Deduplicate and sort a member list.
///
/// `PeerId` byte order equals the lexicographic order of the canonical hex
/// encoding, so this yields the string order the wire format promises.
pub fn normalize_members(members: Vec<PeerId>) -> Vec<PeerId> {
    let set: std::collections::BTreeSet<PeerId> = members.into_iter().collect();
    set.into_iter().collect()
}

/// Normalize, validate and sign a snapshot with the issuer's node key.
pub fn sign_snapshot(key: &NodeKey, mut snapshot: Snapshot) -> Result<Snapshot, ClusterError> {
    if snapshot.cluster_id.trim().is_empty() {
        return Err(ClusterError::MissingField("cluster_id"));
    }
    if snapshot.issuer_peer_id.is_none() {
        return Err(ClusterError::MissingField("issuer_peer_id"));
    }
    if snapshot.issued_at.is_none() {
        return Err(ClusterError::MissingField("issued_at"));
    }
    snapshot.members = normalize_members(snapshot.members);
    if snapshot.members.is_empty() {
        return Err(ClusterError::MissingField("members"));
    }

    snapshot.sig = key.sign_b64(&snapshot.canonical_bytes());
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issued_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 21, 11, 11, 1).unwrap()
    }

    fn base_snapshot(issuer: &NodeKey, members: Vec<PeerId>) -> Snapshot {
        Snapshot {
            cluster_id: "default".to_string(),
            issued_at: Some(issued_at()),
            issuer_peer_id: Some(issuer.peer_id()),
            members,
            admin_proof: None,
            sig: String::new(),
        }
    }

    #[test]
    fn test_sign_then_verify() {
        let issuer = NodeKey::generate();
        let member = NodeKey::generate().peer_id();
        let signed = sign_snapshot(&issuer, base_snapshot(&issuer, vec![member])).unwrap();
        signed.verify_signature().unwrap();
    }

    #[test]
    fn test_canonical_bytes_member_order_invariant() {
        let issuer = NodeKey::generate();
        let a = PeerId::from([1; 32]);
        let b = PeerId::from([2; 32]);

        let forward = base_snapshot(&issuer, vec![a, b]);
        let backward = base_snapshot(&issuer, vec![b, a, b]);
        assert_eq!(forward.canonical_bytes(), backward.canonical_bytes());
    }

    #[test]
    fn test_signature_valid_for_any_member_ordering() {
        let issuer = NodeKey::generate();
        let a = PeerId::from([1; 32]);
        let b = PeerId::from([2; 32]);

        let signed = sign_snapshot(&issuer, base_snapshot(&issuer, vec![b, a])).unwrap();
        // Re-shuffle the members; verification re-normalizes.
        let mut shuffled = signed.clone();
        shuffled.members = vec![b, a];
        shuffled.verify_signature().unwrap();
    }

    #[test]
    fn test_canonical_bytes_layout() {
        let issuer = NodeKey::generate();
        let a = PeerId::from([1; 32]);
        let b = PeerId::from([2; 32]);
        let snapshot = base_snapshot(&issuer, vec![b, a]);

        let canonical = String::from_utf8(snapshot.canonical_bytes()).unwrap();
        assert_eq!(
            canonical,
            format!(
                "default|2026-02-21T11:11:01.000000000Z|{}|{a},{b}",
                issuer.peer_id()
            )
        );
    }

    #[test]
    fn test_sign_rejects_empty_members() {
        let issuer = NodeKey::generate();
        let err = sign_snapshot(&issuer, base_snapshot(&issuer, vec![])).unwrap_err();
        assert!(matches!(err, ClusterError::MissingField("members")));
    }

    #[test]
    fn test_sign_rejects_missing_issued_at() {
        let issuer = NodeKey::generate();
        let mut snapshot = base_snapshot(&issuer, vec![issuer.peer_id()]);
        snapshot.issued_at = None;
        assert!(sign_snapshot(&issuer, snapshot).is_err());
    }

    #[test]
    fn test_verify_rejects_tampered_members() {
        let issuer = NodeKey::generate();
        let signed =
            sign_snapshot(&issuer, base_snapshot(&issuer, vec![issuer.peer_id()])).unwrap();
        let mut tampered = signed.clone();
        tampered.members.push(PeerId::from([9; 32]));
        assert!(tampered.verify_signature().is_err());
    }

    #[test]
    fn test_verify_rejects_random_sig_bytes() {
        let issuer = NodeKey::generate();
        let mut signed =
            sign_snapshot(&issuer, base_snapshot(&issuer, vec![issuer.peer_id()])).unwrap();
        signed.sig = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode([0x5au8; 64])
        };
        assert!(matches!(
            signed.verify_signature(),
            Err(ClusterError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let issuer = NodeKey::generate();
        let signed =
            sign_snapshot(&issuer, base_snapshot(&issuer, vec![issuer.peer_id()])).unwrap();
        let json = serde_json::to_string(&signed).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signed);
    }

    #[test]
    fn test_default_snapshot_is_empty() {
        let snapshot = Snapshot::default();
        assert!(snapshot.issued_at.is_none());
        assert!(snapshot.members.is_empty());
        assert!(snapshot.sig.is_empty());
    }
}
