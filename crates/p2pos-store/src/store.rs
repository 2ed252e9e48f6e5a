//! [`PeerDb`] implementation with Fjall (disk) and in-memory backends.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use p2pos_types::{PeerId, PeerRow, Reachability};
use tracing::debug;

use crate::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// Inner backend: either Fjall-backed (disk) or pure in-memory.
enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        peers: Keyspace,
    },
    Memory(RwLock<BTreeMap<[u8; 32], Vec<u8>>>),
}

/// The observed-peer store.
///
/// Rows are created lazily on first observation, mutated by presence
/// events, and pruned only when the authoritative member set shrinks.
/// The local self row is seeded at startup and never overwritten by
/// remote observations.
pub struct PeerDb {
    backend: Backend,
}

impl PeerDb {
    /// Open a persistent store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        let peers = db.keyspace("peers", KeyspaceCreateOptions::default)?;
        Ok(Self {
            backend: Backend::Fjall { db, peers },
        })
    }

    /// Open a temporary disk-backed store (cleaned up on drop).
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        let peers = db.keyspace("peers", KeyspaceCreateOptions::default)?;
        Ok(Self {
            backend: Backend::Fjall { db, peers },
        })
    }

    /// Create a pure in-memory store. Zero disk I/O.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(BTreeMap::new())),
        }
    }

    fn read_row(&self, peer: &PeerId) -> Result<Option<PeerRow>> {
        match &self.backend {
            Backend::Fjall { peers, .. } => match peers.get(peer.as_bytes())? {
                Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
                None => Ok(None),
            },
            Backend::Memory(map) => match map.read().unwrap().get(peer.as_bytes()) {
                Some(bytes) => Ok(Some(postcard::from_bytes(bytes)?)),
                None => Ok(None),
            },
        }
    }

    fn write_row(&self, row: &PeerRow) -> Result<()> {
        let value = postcard::to_allocvec(row)?;
        match &self.backend {
            Backend::Fjall { peers, .. } => {
                peers.insert(row.peer_id.as_bytes(), value.as_slice())?;
            }
            Backend::Memory(map) => {
                map.write().unwrap().insert(*row.peer_id.as_bytes(), value);
            }
        }
        Ok(())
    }

    fn delete_row(&self, peer: &PeerId) -> Result<()> {
        match &self.backend {
            Backend::Fjall { peers, .. } => {
                peers.remove(peer.as_bytes())?;
            }
            Backend::Memory(map) => {
                map.write().unwrap().remove(peer.as_bytes());
            }
        }
        Ok(())
    }

    /// Fetch a single row.
    pub fn get(&self, peer: &PeerId) -> Result<Option<PeerRow>> {
        self.read_row(peer)
    }

    /// All rows, sorted by peer id.
    pub fn list(&self) -> Result<Vec<PeerRow>> {
        let mut rows = Vec::new();
        match &self.backend {
            Backend::Fjall { peers, .. } => {
                for guard in peers.iter() {
                    let value = guard.value()?;
                    rows.push(postcard::from_bytes(&value)?);
                }
            }
            Backend::Memory(map) => {
                for value in map.read().unwrap().values() {
                    rows.push(postcard::from_bytes(value)?);
                }
            }
        }
        rows.sort_by_key(|row: &PeerRow| row.peer_id);
        Ok(rows)
    }

    /// Seed the local node's own row with `reachability = self`.
    pub fn seed_self(&self, local: PeerId, now: DateTime<Utc>) -> Result<()> {
        self.write_row(&PeerRow {
            peer_id: local,
            last_remote_addr: String::new(),
            last_seen_at: now,
            reachability: Reachability::SelfNode,
            observed_by: None,
        })
    }

    /// Enforce `rows == member set`: prune rows outside the set, insert
    /// missing members as offline. Existing rows for members are kept
    /// as-is.
    pub fn sync_members(&self, members: &[PeerId], now: DateTime<Utc>) -> Result<()> {
        let member_set: std::collections::BTreeSet<PeerId> = members.iter().copied().collect();

        for row in self.list()? {
            if !member_set.contains(&row.peer_id) {
                self.delete_row(&row.peer_id)?;
                debug!(peer = %row.peer_id.fmt_short(), "pruned non-member row");
            }
        }

        for member in &member_set {
            if self.read_row(member)?.is_none() {
                self.write_row(&PeerRow {
                    peer_id: *member,
                    last_remote_addr: String::new(),
                    last_seen_at: now,
                    reachability: Reachability::Offline,
                    observed_by: None,
                })?;
            }
        }
        Ok(())
    }

    /// Record a direct observation (connect or heartbeat): the peer is
    /// online as of `now`. An empty `remote_addr` keeps the previous one.
    /// Self rows are left untouched.
    pub fn upsert_seen(
        &self,
        peer: PeerId,
        remote_addr: &str,
        observed_by: PeerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut row = match self.read_row(&peer)? {
            Some(existing) if existing.reachability == Reachability::SelfNode => return Ok(()),
            Some(existing) => existing,
            None => PeerRow {
                peer_id: peer,
                last_remote_addr: String::new(),
                last_seen_at: now,
                reachability: Reachability::Offline,
                observed_by: None,
            },
        };

        if !remote_addr.is_empty() {
            row.last_remote_addr = remote_addr.to_string();
        }
        row.last_seen_at = now;
        row.reachability = Reachability::Online;
        row.observed_by = Some(observed_by);
        self.write_row(&row)
    }

    /// Flip an existing row to offline, preserving `last_remote_addr`.
    /// Missing and self rows are left untouched.
    pub fn mark_offline(
        &self,
        peer: PeerId,
        observed_by: PeerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut row) = self.read_row(&peer)? else {
            return Ok(());
        };
        if row.reachability == Reachability::SelfNode {
            return Ok(());
        }
        row.reachability = Reachability::Offline;
        row.last_seen_at = now;
        row.observed_by = Some(observed_by);
        self.write_row(&row)
    }

    /// Merge a remotely observed row, last-writer-wins on the observation
    /// timestamp.
    ///
    /// Only existing rows are updated (the member sync decides which rows
    /// exist). Self rows are never downgraded, a remote claim of `self`
    /// is normalized to `online`, and a fresh local `online` view is not
    /// overwritten by a remote observation.
    pub fn merge_observed(
        &self,
        incoming: &PeerRow,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut existing) = self.read_row(&incoming.peer_id)? else {
            return Ok(());
        };
        if existing.reachability == Reachability::SelfNode {
            return Ok(());
        }

        let mut changed = false;
        if existing.last_remote_addr.is_empty() && !incoming.last_remote_addr.is_empty() {
            existing.last_remote_addr = incoming.last_remote_addr.clone();
            changed = true;
        }

        if observed_at > existing.last_seen_at {
            existing.last_seen_at = incoming.last_seen_at;
            existing.observed_by = incoming.observed_by;
            if existing.reachability != Reachability::Online {
                existing.reachability = match incoming.reachability {
                    Reachability::SelfNode => Reachability::Online,
                    other => other,
                };
            }
            if !incoming.last_remote_addr.is_empty() {
                existing.last_remote_addr = incoming.last_remote_addr.clone();
            }
            changed = true;
        }

        if changed {
            self.write_row(&existing)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.backend {
            Backend::Fjall { .. } => "fjall",
            Backend::Memory(_) => "memory",
        };
        f.debug_struct("PeerDb").field("backend", &kind).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn peer(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 21, 11, 0, 0).unwrap()
    }

    #[test]
    fn test_seed_self_row() {
        let db = PeerDb::in_memory();
        db.seed_self(peer(1), t0()).unwrap();

        let row = db.get(&peer(1)).unwrap().unwrap();
        assert_eq!(row.reachability, Reachability::SelfNode);
        assert!(row.observed_by.is_none());
    }

    #[test]
    fn test_upsert_seen_creates_and_updates() {
        let db = PeerDb::in_memory();
        db.upsert_seen(peer(2), "192.0.2.1:4100", peer(1), t0()).unwrap();

        let row = db.get(&peer(2)).unwrap().unwrap();
        assert_eq!(row.reachability, Reachability::Online);
        assert_eq!(row.last_remote_addr, "192.0.2.1:4100");
        assert_eq!(row.observed_by, Some(peer(1)));

        // Empty address keeps the previous one.
        db.upsert_seen(peer(2), "", peer(1), t0() + Duration::seconds(5))
            .unwrap();
        let row = db.get(&peer(2)).unwrap().unwrap();
        assert_eq!(row.last_remote_addr, "192.0.2.1:4100");
        assert_eq!(row.last_seen_at, t0() + Duration::seconds(5));
    }

    #[test]
    fn test_upsert_seen_never_touches_self_row() {
        let db = PeerDb::in_memory();
        db.seed_self(peer(1), t0()).unwrap();
        db.upsert_seen(peer(1), "192.0.2.2:9", peer(2), t0() + Duration::seconds(1))
            .unwrap();

        let row = db.get(&peer(1)).unwrap().unwrap();
        assert_eq!(row.reachability, Reachability::SelfNode);
        assert!(row.last_remote_addr.is_empty());
    }

    #[test]
    fn test_mark_offline_preserves_addr() {
        let db = PeerDb::in_memory();
        db.upsert_seen(peer(2), "192.0.2.1:4100", peer(1), t0()).unwrap();
        db.mark_offline(peer(2), peer(1), t0() + Duration::seconds(1)).unwrap();

        let row = db.get(&peer(2)).unwrap().unwrap();
        assert_eq!(row.reachability, Reachability::Offline);
        assert_eq!(row.last_remote_addr, "192.0.2.1:4100");
    }

    #[test]
    fn test_mark_offline_on_missing_row_is_noop() {
        let db = PeerDb::in_memory();
        db.mark_offline(peer(9), peer(1), t0()).unwrap();
        assert!(db.get(&peer(9)).unwrap().is_none());
    }

    #[test]
    fn test_sync_members_prunes_and_inserts() {
        let db = PeerDb::in_memory();
        db.seed_self(peer(1), t0()).unwrap();
        db.upsert_seen(peer(2), "192.0.2.1:1", peer(1), t0()).unwrap();
        db.upsert_seen(peer(3), "192.0.2.1:2", peer(1), t0()).unwrap();

        // New member set drops peer 3, adds peer 4.
        db.sync_members(&[peer(1), peer(2), peer(4)], t0()).unwrap();

        let rows = db.list().unwrap();
        let ids: Vec<PeerId> = rows.iter().map(|r| r.peer_id).collect();
        assert_eq!(ids, vec![peer(1), peer(2), peer(4)]);

        // Existing rows kept as-is, new member starts offline.
        assert_eq!(
            db.get(&peer(2)).unwrap().unwrap().reachability,
            Reachability::Online
        );
        assert_eq!(
            db.get(&peer(4)).unwrap().unwrap().reachability,
            Reachability::Offline
        );
        assert_eq!(
            db.get(&peer(1)).unwrap().unwrap().reachability,
            Reachability::SelfNode
        );
    }

    #[test]
    fn test_merge_observed_last_writer_wins() {
        let db = PeerDb::in_memory();
        db.upsert_seen(peer(2), "192.0.2.1:1", peer(1), t0()).unwrap();
        db.mark_offline(peer(2), peer(1), t0() + Duration::seconds(1)).unwrap();

        // Older observation: ignored.
        let stale = PeerRow {
            peer_id: peer(2),
            last_remote_addr: "198.51.100.9:9".to_string(),
            last_seen_at: t0() - Duration::minutes(5),
            reachability: Reachability::Online,
            observed_by: Some(peer(3)),
        };
        db.merge_observed(&stale, t0() - Duration::minutes(5)).unwrap();
        let row = db.get(&peer(2)).unwrap().unwrap();
        assert_eq!(row.reachability, Reachability::Offline);
        assert_eq!(row.observed_by, Some(peer(1)));

        // Newer observation: wins.
        let fresh = PeerRow {
            peer_id: peer(2),
            last_remote_addr: "198.51.100.9:9".to_string(),
            last_seen_at: t0() + Duration::minutes(5),
            reachability: Reachability::Online,
            observed_by: Some(peer(3)),
        };
        db.merge_observed(&fresh, t0() + Duration::minutes(5)).unwrap();
        let row = db.get(&peer(2)).unwrap().unwrap();
        assert_eq!(row.reachability, Reachability::Online);
        assert_eq!(row.observed_by, Some(peer(3)));
        assert_eq!(row.last_remote_addr, "198.51.100.9:9");
    }

    #[test]
    fn test_merge_observed_never_downgrades_self() {
        let db = PeerDb::in_memory();
        db.seed_self(peer(1), t0()).unwrap();

        let incoming = PeerRow {
            peer_id: peer(1),
            last_remote_addr: "198.51.100.9:9".to_string(),
            last_seen_at: t0() + Duration::hours(1),
            reachability: Reachability::Offline,
            observed_by: Some(peer(3)),
        };
        db.merge_observed(&incoming, t0() + Duration::hours(1)).unwrap();

        let row = db.get(&peer(1)).unwrap().unwrap();
        assert_eq!(row.reachability, Reachability::SelfNode);
    }

    #[test]
    fn test_merge_observed_skips_unknown_rows() {
        let db = PeerDb::in_memory();
        let incoming = PeerRow {
            peer_id: peer(8),
            last_remote_addr: String::new(),
            last_seen_at: t0(),
            reachability: Reachability::Online,
            observed_by: Some(peer(3)),
        };
        db.merge_observed(&incoming, t0()).unwrap();
        assert!(db.get(&peer(8)).unwrap().is_none());
    }

    #[test]
    fn test_merge_observed_remote_self_claim_normalized() {
        let db = PeerDb::in_memory();
        db.sync_members(&[peer(2)], t0()).unwrap();

        let incoming = PeerRow {
            peer_id: peer(2),
            last_remote_addr: String::new(),
            last_seen_at: t0() + Duration::seconds(10),
            reachability: Reachability::SelfNode,
            observed_by: Some(peer(2)),
        };
        db.merge_observed(&incoming, t0() + Duration::seconds(10)).unwrap();
        assert_eq!(
            db.get(&peer(2)).unwrap().unwrap().reachability,
            Reachability::Online
        );
    }

    #[test]
    fn test_fjall_backend_roundtrip() {
        let db = PeerDb::open_temporary().unwrap();
        db.seed_self(peer(1), t0()).unwrap();
        db.upsert_seen(peer(2), "192.0.2.1:1", peer(1), t0()).unwrap();

        let rows = db.list().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].peer_id, peer(1));
        assert_eq!(rows[1].peer_id, peer(2));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = PeerDb::open(dir.path().join("peers")).unwrap();
            db.upsert_seen(peer(2), "192.0.2.1:1", peer(1), t0()).unwrap();
        }
        let db = PeerDb::open(dir.path().join("peers")).unwrap();
        assert!(db.get(&peer(2)).unwrap().is_some());
    }
}
