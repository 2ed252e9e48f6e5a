//! Error types for the node runtime services.

use p2pos_cluster::ClusterError;
use p2pos_net::NetError;
use p2pos_store::StoreError;

/// Errors surfaced by the runtime services.
///
/// The publish path returns the first failed gate as a typed variant so
/// callers can tell "not healthy" from "no credential" from a validation
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Administrator publish requires the `healthy` runtime state.
    #[error("node not healthy")]
    NotHealthy,

    /// Administrator publish requires a locally configured admin proof.
    #[error("admin_proof not configured")]
    NoAdminProof,

    /// The local node is not part of any cluster yet.
    #[error("node is unconfigured")]
    Unconfigured,

    /// Snapshot, proof or signature validation failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A transport operation failed.
    #[error(transparent)]
    Net(#[from] NetError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Seed resolution failed.
    #[error("resolve failed: {0}")]
    Resolve(String),
}
