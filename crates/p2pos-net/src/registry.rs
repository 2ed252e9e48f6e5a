//! Live-connection tracking.
//!
//! The registry counts live connections per peer (a peer may hold one
//! connection per protocol) and emits [`PeerConnected`] when the first
//! one opens and [`PeerDisconnected`] when the last one closes. The
//! runtime state machine and the presence adapter are driven by these
//! events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use p2pos_types::PeerId;
use p2pos_types::events::{EventBus, PeerConnected, PeerDisconnected};
use tracing::debug;

struct PeerEntry {
    conns: usize,
    last_addr: String,
}

struct Inner {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    bus: EventBus,
}

/// Tracks which peers currently have at least one live connection.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    /// Create a registry emitting events on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers: Mutex::new(HashMap::new()),
                bus,
            }),
        }
    }

    /// Record a live connection to `peer`.
    ///
    /// The returned guard releases the connection on drop; callers tie it
    /// to the connection's lifetime (e.g. dropped when `closed()`
    /// resolves). `remote_addr` is the best-known remote address, empty
    /// when the transport cannot tell.
    pub fn register(&self, peer: PeerId, remote_addr: String) -> ConnectionGuard {
        let first = {
            let mut peers = self.inner.peers.lock().expect("registry lock");
            let entry = peers.entry(peer).or_insert(PeerEntry {
                conns: 0,
                last_addr: String::new(),
            });
            entry.conns += 1;
            if !remote_addr.is_empty() {
                entry.last_addr = remote_addr.clone();
            }
            entry.conns == 1
        };

        if first {
            debug!(peer = %peer.fmt_short(), "peer connected");
            self.inner.bus.emit(PeerConnected {
                peer_id: peer,
                remote_addr,
                at: Utc::now(),
            });
        }

        ConnectionGuard {
            inner: self.inner.clone(),
            peer,
        }
    }

    /// Peers with at least one live connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .peers
            .lock()
            .expect("registry lock")
            .keys()
            .copied()
            .collect()
    }

    /// Whether `peer` has a live connection.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner
            .peers
            .lock()
            .expect("registry lock")
            .contains_key(peer)
    }

    /// Last known remote address for `peer`, empty when unknown.
    pub fn last_addr(&self, peer: &PeerId) -> String {
        self.inner
            .peers
            .lock()
            .expect("registry lock")
            .get(peer)
            .map(|e| e.last_addr.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.inner.peers.lock().expect("registry lock");
        f.debug_struct("ConnectionRegistry")
            .field("connected", &peers.len())
            .finish()
    }
}

/// Releases one live connection when dropped.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
    peer: PeerId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let last = {
            let mut peers = self.inner.peers.lock().expect("registry lock");
            match peers.get_mut(&self.peer) {
                Some(entry) => {
                    entry.conns = entry.conns.saturating_sub(1);
                    if entry.conns == 0 {
                        peers.remove(&self.peer);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            debug!(peer = %self.peer.fmt_short(), "peer disconnected");
            self.inner.bus.emit(PeerDisconnected {
                peer_id: self.peer,
                at: Utc::now(),
            });
        }
    }
}
