//! Per-peer "protocol not supported" marks.
//!
//! When a peer rejects a protocol's ALPN, the peer is marked and the
//! protocol skips it until the peer's next connect event clears the mark.

use std::collections::HashSet;
use std::sync::RwLock;

use p2pos_types::PeerId;

/// Concurrent set of peers that rejected one protocol.
#[derive(Debug, Default)]
pub struct UnsupportedMarks {
    peers: RwLock<HashSet<PeerId>>,
}

impl UnsupportedMarks {
    /// Empty mark set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `peer` as unsupported.
    pub fn mark(&self, peer: PeerId) {
        self.peers.write().expect("marks lock").insert(peer);
    }

    /// Clear the mark for `peer` (on its connect event).
    pub fn clear(&self, peer: &PeerId) {
        self.peers.write().expect("marks lock").remove(peer);
    }

    /// Whether `peer` is currently marked.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().expect("marks lock").contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_clear_cycle() {
        let marks = UnsupportedMarks::new();
        let peer = PeerId::from([1; 32]);

        assert!(!marks.contains(&peer));
        marks.mark(peer);
        assert!(marks.contains(&peer));
        marks.clear(&peer);
        assert!(!marks.contains(&peer));
        // Clearing twice is fine.
        marks.clear(&peer);
    }
}
