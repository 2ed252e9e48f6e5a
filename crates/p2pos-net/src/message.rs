//! JSON wire payloads.
//!
//! All stream payloads are JSON, newline-agnostic, written in one piece
//! and read to EOF on the other side.

use chrono::{DateTime, Utc};
use p2pos_cluster::Snapshot;
use p2pos_types::{PeerId, PeerRow};
use serde::{Deserialize, Serialize};

/// Response to a membership fetch: the responder's current snapshot.
///
/// An empty snapshot with a non-empty `error` means "not initialized".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FetchResponse {
    /// The responder's current snapshot.
    #[serde(default)]
    pub snapshot: Snapshot,
    /// Set when the responder has nothing to serve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to a membership push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Whether the snapshot validated (stale snapshots count as applied).
    pub applied: bool,
    /// Rejection reason when `applied` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A signed presence beacon, sent every 30 seconds to member peers.
///
/// `ts` stays a string on the wire; the canonical signing bytes are
/// `cluster_id|peer_id|ts` with `ts` re-rendered in RFC3339 nanosecond
/// UTC from the parsed timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// The sender's cluster.
    #[serde(default)]
    pub cluster_id: String,
    /// The sender.
    pub peer_id: PeerId,
    /// Send time, RFC3339 UTC.
    pub ts: String,
    /// Base64 signature by the sender's node key.
    pub sig: String,
}

/// Scope of a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatusScope {
    /// The responder's own store rows.
    #[default]
    Local,
    /// The union of the responder's rows and its connected peers' local
    /// rows, merged by last-seen timestamp.
    Cluster,
}

/// Status query request. A missing scope means `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusRequest {
    /// Requested scope.
    #[serde(default)]
    pub scope: StatusScope,
}

/// Status query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// When the responder assembled the answer (UTC).
    pub generated_at: DateTime<Utc>,
    /// Observed peer rows, sorted by peer id.
    pub peers: Vec<PeerRow>,
    /// Set when the responder cannot answer (e.g. unconfigured).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One record in a peer-exchange response: an observed row plus the time
/// of the observation used for last-writer-wins merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// The observed row.
    #[serde(flatten)]
    pub row: PeerRow,
    /// When the responder last updated the row (UTC).
    pub updated_at: DateTime<Utc>,
}

/// Peer-exchange response: dialable addresses plus observed records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerExchangeResponse {
    /// Dialable `<peer_id>@host:port` strings the responder knows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<String>,
    /// Observed peer records.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<ExchangeRecord>,
}

/// Decode a JSON payload read to EOF from a stream.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, crate::NetError> {
    serde_json::from_slice(bytes).map_err(|e| crate::NetError::Decode(e.to_string()))
}

/// Encode a JSON payload for a stream write.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("wire types serialize infallibly")
}
