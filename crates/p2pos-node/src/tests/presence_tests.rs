//! Presence adapter tests: peer events become idempotent store rows.

use std::sync::Arc;

use chrono::Duration;
use p2pos_store::PeerDb;
use p2pos_types::events::{
    EventBus, MembershipApplied, PeerConnected, PeerDisconnected, PeerHeartbeat,
};
use p2pos_types::{PeerId, Reachability};
use tokio::sync::watch;

use super::{test_now, wait_for};
use crate::presence;

fn peer(n: u8) -> PeerId {
    PeerId::from([n; 32])
}

struct Fixture {
    db: Arc<PeerDb>,
    bus: EventBus,
    _shutdown: watch::Sender<bool>,
}

fn fixture(local: PeerId) -> Fixture {
    let db = Arc::new(PeerDb::in_memory());
    let bus = EventBus::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    presence::start(db.clone(), local, &bus, shutdown_rx);
    Fixture {
        db,
        bus,
        _shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn test_connect_event_upserts_online_row() {
    let local = peer(1);
    let f = fixture(local);

    f.bus.emit(PeerConnected {
        peer_id: peer(2),
        remote_addr: "192.0.2.2:4100".to_string(),
        at: test_now(),
    });

    wait_for("row appears", || {
        f.db.get(&peer(2)).unwrap().is_some()
    })
    .await;

    let row = f.db.get(&peer(2)).unwrap().unwrap();
    assert_eq!(row.reachability, Reachability::Online);
    assert_eq!(row.last_remote_addr, "192.0.2.2:4100");
    assert_eq!(row.observed_by, Some(local));
}

#[tokio::test]
async fn test_disconnect_flips_to_offline_preserving_addr() {
    let f = fixture(peer(1));

    f.bus.emit(PeerConnected {
        peer_id: peer(2),
        remote_addr: "192.0.2.2:4100".to_string(),
        at: test_now(),
    });
    wait_for("row appears", || {
        f.db.get(&peer(2)).unwrap().is_some()
    })
    .await;

    f.bus.emit(PeerDisconnected {
        peer_id: peer(2),
        at: test_now() + Duration::seconds(5),
    });
    wait_for("row goes offline", || {
        f.db.get(&peer(2))
            .unwrap()
            .is_some_and(|row| row.reachability == Reachability::Offline)
    })
    .await;

    let row = f.db.get(&peer(2)).unwrap().unwrap();
    assert_eq!(row.last_remote_addr, "192.0.2.2:4100");
}

#[tokio::test]
async fn test_heartbeat_refreshes_row_without_connect() {
    let f = fixture(peer(1));

    f.bus.emit(PeerHeartbeat {
        peer_id: peer(3),
        remote_addr: "198.51.100.3:4100".to_string(),
        at: test_now(),
    });

    wait_for("heartbeat row", || {
        f.db.get(&peer(3))
            .unwrap()
            .is_some_and(|row| row.reachability == Reachability::Online)
    })
    .await;
}

#[tokio::test]
async fn test_membership_applied_prunes_rows() {
    let f = fixture(peer(1));

    f.bus.emit(PeerConnected {
        peer_id: peer(2),
        remote_addr: String::new(),
        at: test_now(),
    });
    wait_for("row appears", || {
        f.db.get(&peer(2)).unwrap().is_some()
    })
    .await;

    // The new member set keeps peer 4 only.
    f.bus.emit(MembershipApplied {
        cluster_id: "default".to_string(),
        issued_at: test_now() + Duration::seconds(1),
        members: vec![peer(4)],
    });

    wait_for("row pruned", || {
        f.db.get(&peer(2)).unwrap().is_none() && f.db.get(&peer(4)).unwrap().is_some()
    })
    .await;
    assert_eq!(
        f.db.get(&peer(4)).unwrap().unwrap().reachability,
        Reachability::Offline
    );
}

#[tokio::test]
async fn test_self_row_survives_peer_events() {
    let local = peer(1);
    let f = fixture(local);
    f.db.seed_self(local, test_now()).unwrap();

    f.bus.emit(PeerConnected {
        peer_id: local,
        remote_addr: "203.0.113.1:1".to_string(),
        at: test_now() + Duration::seconds(1),
    });
    // Let another event flush through to order the queue.
    f.bus.emit(PeerConnected {
        peer_id: peer(2),
        remote_addr: String::new(),
        at: test_now() + Duration::seconds(1),
    });
    wait_for("second row lands", || {
        f.db.get(&peer(2)).unwrap().is_some()
    })
    .await;

    let row = f.db.get(&local).unwrap().unwrap();
    assert_eq!(row.reachability, Reachability::SelfNode);
    assert!(row.last_remote_addr.is_empty());
}
