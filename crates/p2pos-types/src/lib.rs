//! Shared types for P2POS.
//!
//! This crate defines the types used across the P2POS workspace:
//! the peer identifier ([`PeerId`]), the observed-peer row stored and
//! exchanged by the status protocol ([`PeerRow`], [`Reachability`]),
//! the [`Clock`] capability, and the typed [`events::EventBus`].

pub mod events;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Identifier for a cluster peer: the raw 32 bytes of its ed25519
/// verifying key, canonically encoded as lowercase hex.
///
/// Equality is byte identity. The lexicographic order of the hex encoding
/// equals the byte order, so sorting `PeerId`s sorts their canonical
/// string forms.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for log output (first 10 hex chars).
    pub fn fmt_short(&self) -> String {
        let mut s = String::with_capacity(10);
        for byte in &self.0[..5] {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

/// Error returned when a peer id string is not 64 hex characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePeerIdError(String);

impl fmt::Display for ParsePeerIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid peer id {:?}: expected 64 hex characters", self.0)
    }
}

impl std::error::Error for ParsePeerIdError {}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 64 {
            return Err(ParsePeerIdError(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParsePeerIdError(s.to_string()))?;
            bytes[i] =
                u8::from_str_radix(hex, 16).map_err(|_| ParsePeerIdError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

// Peer ids travel as strings in every JSON payload.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Observed peer rows
// ---------------------------------------------------------------------------

/// Reachability of a peer as recorded by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    /// The observer currently has a live connection or recent heartbeat.
    Online,
    /// The observer has lost its connection to the peer.
    Offline,
    /// The row describes the observer itself. Never overwritten by
    /// remote observations.
    #[serde(rename = "self")]
    SelfNode,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Online => write!(f, "online"),
            Reachability::Offline => write!(f, "offline"),
            Reachability::SelfNode => write!(f, "self"),
        }
    }
}

/// One observed peer, keyed by [`PeerId`].
///
/// Rows are created lazily on first observation, mutated by the presence
/// adapter, and pruned only when the authoritative member set shrinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRow {
    /// The observed peer.
    pub peer_id: PeerId,
    /// Last remote address the peer was seen at. Empty when unknown.
    #[serde(default)]
    pub last_remote_addr: String,
    /// When the peer was last seen (UTC).
    pub last_seen_at: DateTime<Utc>,
    /// Reachability from the observer's point of view.
    pub reachability: Reachability,
    /// Which peer made the observation. `None` for seeded rows.
    #[serde(default)]
    pub observed_by: Option<PeerId>,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Format a timestamp the way every canonical signing payload expects it:
/// RFC3339 with nanosecond precision, UTC, `Z` suffix.
pub fn rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Capability interface producing UTC timestamps.
///
/// Injected wherever a validity window is checked so tests can pin time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// A clock fixed at a given instant, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_peer_id_display_roundtrip() {
        let id = PeerId::from([0xab; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        let parsed: PeerId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_peer_id_rejects_bad_input() {
        assert!("zz".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err());
        let not_hex = "g".repeat(64);
        assert!(not_hex.parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_parse_trims_whitespace() {
        let id = PeerId::from([7; 32]);
        let parsed: PeerId = format!("  {id} ").parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_peer_id_ordering_matches_hex_ordering() {
        let low = PeerId::from([0u8; 32]);
        let high = PeerId::from([0xff; 32]);
        assert!(low < high);
        assert!(low.to_string() < high.to_string());
    }

    #[test]
    fn test_peer_id_json_is_a_string() {
        let id = PeerId::from([1; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_reachability_wire_names() {
        assert_eq!(
            serde_json::to_string(&Reachability::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(
            serde_json::to_string(&Reachability::SelfNode).unwrap(),
            "\"self\""
        );
        let r: Reachability = serde_json::from_str("\"offline\"").unwrap();
        assert_eq!(r, Reachability::Offline);
    }

    #[test]
    fn test_peer_row_json_roundtrip() {
        let row = PeerRow {
            peer_id: PeerId::from([2; 32]),
            last_remote_addr: "203.0.113.9:4100".to_string(),
            last_seen_at: Utc.with_ymd_and_hms(2026, 2, 21, 11, 11, 1).unwrap(),
            reachability: Reachability::Online,
            observed_by: Some(PeerId::from([3; 32])),
        };
        let json = serde_json::to_string(&row).unwrap();
        let back: PeerRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_rfc3339_nanos_format() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 21, 11, 11, 1).unwrap()
            + chrono::Duration::nanoseconds(508_000_000);
        assert_eq!(rfc3339_nanos(ts), "2026-02-21T11:11:01.508000000Z");
    }

    #[test]
    fn test_fixed_clock() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let clock = FixedClock(ts);
        assert_eq!(clock.now_utc(), ts);
    }
}
