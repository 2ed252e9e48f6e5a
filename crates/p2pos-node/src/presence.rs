//! Presence: translates peer events into idempotent store rows.
//!
//! Events are funneled through a bounded queue with drop-newest
//! semantics into a single writer task, so bursts cannot grow memory and
//! the store sees one writer.

use std::sync::Arc;

use p2pos_store::PeerDb;
use p2pos_types::PeerId;
use p2pos_types::events::{
    EventBus, MembershipApplied, PeerConnected, PeerDisconnected, PeerHeartbeat,
    PeerStateObserved,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bound of the event funnel; newest events are dropped beyond it.
const QUEUE_CAPACITY: usize = 256;

enum PresenceEvent {
    Connected(PeerConnected),
    Disconnected(PeerDisconnected),
    Heartbeat(PeerHeartbeat),
    Observed(PeerStateObserved),
    Members(MembershipApplied),
}

/// Start the presence adapter: subscribes to peer and membership events
/// and applies them to the store.
pub fn start(
    db: Arc<PeerDb>,
    local: PeerId,
    bus: &EventBus,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<PresenceEvent>(QUEUE_CAPACITY);

    // One forwarder per event type; try_send drops the newest event when
    // the funnel is full.
    spawn_forwarder(bus.subscribe::<PeerConnected>(), tx.clone(), PresenceEvent::Connected);
    spawn_forwarder(
        bus.subscribe::<PeerDisconnected>(),
        tx.clone(),
        PresenceEvent::Disconnected,
    );
    spawn_forwarder(bus.subscribe::<PeerHeartbeat>(), tx.clone(), PresenceEvent::Heartbeat);
    spawn_forwarder(bus.subscribe::<PeerStateObserved>(), tx.clone(), PresenceEvent::Observed);
    spawn_forwarder(bus.subscribe::<MembershipApplied>(), tx, PresenceEvent::Members);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let outcome = match event {
                PresenceEvent::Connected(ev) => {
                    db.upsert_seen(ev.peer_id, &ev.remote_addr, local, ev.at)
                }
                PresenceEvent::Disconnected(ev) => db.mark_offline(ev.peer_id, local, ev.at),
                PresenceEvent::Heartbeat(ev) => {
                    db.upsert_seen(ev.peer_id, &ev.remote_addr, local, ev.at)
                }
                PresenceEvent::Observed(ev) => db.merge_observed(&ev.row, ev.observed_at),
                PresenceEvent::Members(ev) => db.sync_members(&ev.members, ev.issued_at),
            };
            if let Err(err) = outcome {
                warn!(%err, "presence store update failed");
            }
        }
        debug!("presence adapter stopped");
    })
}

fn spawn_forwarder<E, F>(
    mut rx: p2pos_types::events::EventReceiver<E>,
    tx: mpsc::Sender<PresenceEvent>,
    wrap: F,
) where
    E: p2pos_types::events::Event,
    F: Fn(E) -> PresenceEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if tx.try_send(wrap(event)).is_err() {
                warn!(
                    event_type = std::any::type_name::<E>(),
                    "presence queue full, dropping event"
                );
            }
        }
    });
}
