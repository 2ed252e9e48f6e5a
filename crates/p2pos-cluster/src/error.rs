//! Error types for the cluster core.

/// Errors produced by identity handling, snapshot validation and admin
/// proof checks.
///
/// Validation errors are reported and dropped at the protocol layer; they
/// never propagate across peers.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Base64 or peer-id decoding failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Key material could not be parsed into an ed25519 key.
    #[error("invalid key material: {0}")]
    Key(String),

    /// The snapshot names a different cluster than the local one.
    #[error("cluster_id mismatch")]
    ClusterMismatch,

    /// A required field is empty or missing.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// The snapshot signature does not verify against the issuer's key.
    #[error("snapshot signature invalid")]
    SignatureInvalid,

    /// The admin proof's role is not `admin`.
    #[error("admin proof role invalid")]
    ProofRole,

    /// The admin proof names a different cluster.
    #[error("admin proof cluster mismatch")]
    ProofClusterMismatch,

    /// The admin proof is bound to a different peer than the issuer.
    #[error("admin proof peer mismatch")]
    ProofPeerMismatch,

    /// `now` is outside `[valid_from, valid_to]`.
    #[error("admin proof expired or not yet valid")]
    ProofOutsideValidity,

    /// The admin proof signature does not verify against the system key.
    #[error("admin proof signature invalid")]
    ProofSignatureInvalid,

    /// Admin proof validation was requested without a configured system key.
    #[error("system_pubkey is required for admin proof validation")]
    SystemKeyRequired,
}
