//! Type-safe event bus for intra-node pub/sub.
//!
//! Transport connectivity, heartbeats, membership changes and shutdown all
//! travel as typed events: the transport layer emits them, and the presence
//! adapter, the runtime state machine and the daemon subscribe without
//! coupling to each other.
//!
//! Each event type is a distinct struct implementing the [`Event`] marker
//! trait. Internally the bus keeps a `HashMap<TypeId, Box<dyn Any>>` where
//! each value is a `tokio::sync::broadcast::Sender<E>`; channels are created
//! lazily on the first `subscribe()` for a given type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::{PeerId, PeerRow};

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// Marker trait for all events that can travel through the [`EventBus`].
///
/// Subscribers receive only events of the type they subscribed to.
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A connection to a peer was established (inbound or outbound).
#[derive(Clone, Debug)]
pub struct PeerConnected {
    /// The remote peer.
    pub peer_id: PeerId,
    /// Remote address, if the transport knows one. Empty otherwise.
    pub remote_addr: String,
    /// When the connection was observed (UTC).
    pub at: DateTime<Utc>,
}
impl Event for PeerConnected {}

/// The last connection to a peer was closed.
#[derive(Clone, Debug)]
pub struct PeerDisconnected {
    /// The remote peer.
    pub peer_id: PeerId,
    /// When the disconnect was observed (UTC).
    pub at: DateTime<Utc>,
}
impl Event for PeerDisconnected {}

/// A valid heartbeat arrived from a member peer.
#[derive(Clone, Debug)]
pub struct PeerHeartbeat {
    /// The sender.
    pub peer_id: PeerId,
    /// Remote address of the heartbeat stream. Empty when unknown.
    pub remote_addr: String,
    /// When the heartbeat was accepted (UTC).
    pub at: DateTime<Utc>,
}
impl Event for PeerHeartbeat {}

/// A peer's state as reported by a remote observer (status responses,
/// peer exchange). Merged last-writer-wins by the presence adapter.
#[derive(Clone, Debug)]
pub struct PeerStateObserved {
    /// The observed row.
    pub row: PeerRow,
    /// When the remote observation was made (UTC).
    pub observed_at: DateTime<Utc>,
}
impl Event for PeerStateObserved {}

/// A membership snapshot was applied and advanced the stored `issued_at`.
#[derive(Clone, Debug)]
pub struct MembershipApplied {
    /// Cluster the snapshot belongs to.
    pub cluster_id: String,
    /// Issue timestamp of the applied snapshot.
    pub issued_at: DateTime<Utc>,
    /// The new authoritative member set, normalized.
    pub members: Vec<PeerId>,
}
impl Event for MembershipApplied {}

/// Process shutdown was requested. Published exactly once.
#[derive(Clone, Debug)]
pub struct ShutdownRequested {
    /// Human-readable origin, e.g. `signal:SIGTERM`.
    pub reason: String,
}
impl Event for ShutdownRequested {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus for intra-node communication.
///
/// Clonable (`Arc` inside), thread-safe, non-blocking emits. Each event
/// type gets its own independent broadcast channel, so subscribers of
/// [`PeerDisconnected`] never receive [`PeerHeartbeat`] events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Non-blocking: if nobody has subscribed to `E` yet, the event is
    /// dropped silently.
    pub fn emit<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(boxed) = inner.channels.get(&type_id) {
            let sender = boxed
                .downcast_ref::<broadcast::Sender<E>>()
                .expect("type mismatch in event bus");
            // Err means no active receivers; drop the event.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    ///
    /// The channel is created lazily if it doesn't exist yet.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let type_id = TypeId::of::<E>();
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(type_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventReceiver
// ---------------------------------------------------------------------------

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the bus has been dropped. Skips over lagged
    /// events with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
