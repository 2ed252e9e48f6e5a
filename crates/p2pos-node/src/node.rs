//! Node orchestration: service construction, periodic tasks and the
//! event loop driving runtime-state evaluation.

use std::sync::Arc;
use std::time::Duration;

use p2pos_cluster::{AdminProof, MembershipManager, NodeKey, RuntimeStateMachine};
use p2pos_net::Transport;
use p2pos_store::PeerDb;
use p2pos_types::events::{EventBus, PeerConnected, PeerDisconnected};
use p2pos_types::SharedClock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::heartbeat::{HEARTBEAT_INTERVAL, HeartbeatService};
use crate::membership::{MEMBERSHIP_SYNC_INTERVAL, MembershipService};
use crate::peer_exchange::{PEER_EXCHANGE_INTERVAL, PeerExchangeService};
use crate::presence;
use crate::status::StatusService;

/// A wired-up node: the services plus the shared pieces they hang off.
pub struct Node {
    /// The membership manager.
    pub manager: Arc<MembershipManager>,
    /// The runtime state machine.
    pub runtime: Arc<RuntimeStateMachine>,
    /// The transport.
    pub transport: Arc<dyn Transport>,
    /// The intra-node event bus.
    pub bus: EventBus,
    /// The observed-peer store.
    pub db: Arc<PeerDb>,
    /// Membership protocol service.
    pub membership: Arc<MembershipService>,
    /// Heartbeat service.
    pub heartbeat: Arc<HeartbeatService>,
    /// Status service.
    pub status: Arc<StatusService>,
    /// Peer-exchange service.
    pub exchange: Arc<PeerExchangeService>,
    clock: SharedClock,
}

impl Node {
    /// Build the services and seed the local store row. The runtime
    /// state is evaluated once so a node configured with an initial
    /// member list starts in the right state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<MembershipManager>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        db: Arc<PeerDb>,
        clock: SharedClock,
        node_key: NodeKey,
        admin_proof: Option<AdminProof>,
    ) -> Self {
        let runtime = Arc::new(RuntimeStateMachine::new(manager.clone()));

        let membership = Arc::new(MembershipService::new(
            manager.clone(),
            runtime.clone(),
            transport.clone(),
            bus.clone(),
            clock.clone(),
            node_key.clone(),
            admin_proof,
        ));
        let heartbeat = Arc::new(HeartbeatService::new(
            manager.clone(),
            runtime.clone(),
            transport.clone(),
            bus.clone(),
            clock.clone(),
            node_key,
        ));
        let status = Arc::new(StatusService::new(
            runtime.clone(),
            transport.clone(),
            db.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let exchange = Arc::new(PeerExchangeService::new(
            runtime.clone(),
            transport.clone(),
            db.clone(),
            bus.clone(),
            clock.clone(),
        ));

        runtime.evaluate(&transport.connected_peers(), "membership-set");

        Self {
            manager,
            runtime,
            transport,
            bus,
            db,
            membership,
            heartbeat,
            status,
            exchange,
            clock,
        }
    }

    /// Start the runtime services: the presence adapter, the evaluation
    /// event loop, and the periodic membership-pull, heartbeat and
    /// peer-exchange tasks. Returns the task handles so the daemon can
    /// wait for them during shutdown.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let local = self.transport.local_peer_id();
        if let Err(err) = self.db.seed_self(local, self.clock.now_utc()) {
            debug!(%err, "seeding self row failed");
        }

        let mut tasks = Vec::new();
        tasks.push(presence::start(
            self.db.clone(),
            local,
            &self.bus,
            shutdown.clone(),
        ));
        tasks.push(self.spawn_event_loop(shutdown.clone()));
        tasks.push(spawn_periodic(
            MEMBERSHIP_SYNC_INTERVAL,
            shutdown.clone(),
            {
                let membership = self.membership.clone();
                move || {
                    let membership = membership.clone();
                    async move { membership.sync_once().await }
                }
            },
        ));
        tasks.push(spawn_periodic(HEARTBEAT_INTERVAL, shutdown.clone(), {
            let heartbeat = self.heartbeat.clone();
            move || {
                let heartbeat = heartbeat.clone();
                async move { heartbeat.broadcast().await }
            }
        }));
        tasks.push(spawn_periodic(PEER_EXCHANGE_INTERVAL, shutdown, {
            let exchange = self.exchange.clone();
            move || {
                let exchange = exchange.clone();
                async move { exchange.sync_once().await }
            }
        }));
        tasks
    }

    /// Connect/disconnect events clear unsupported marks and re-evaluate
    /// the runtime state.
    fn spawn_event_loop(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut connected_rx = self.bus.subscribe::<PeerConnected>();
        let mut disconnected_rx = self.bus.subscribe::<PeerDisconnected>();
        let runtime = self.runtime.clone();
        let transport = self.transport.clone();
        let heartbeat = self.heartbeat.clone();
        let status = self.status.clone();
        let exchange = self.exchange.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = connected_rx.recv() => {
                        let Some(event) = event else { break };
                        heartbeat.unsupported().clear(&event.peer_id);
                        status.unsupported().clear(&event.peer_id);
                        exchange.unsupported().clear(&event.peer_id);
                        runtime.evaluate(&transport.connected_peers(), "peer-connected");
                    }
                    event = disconnected_rx.recv() => {
                        if event.is_none() { break }
                        runtime.evaluate(&transport.connected_peers(), "peer-disconnected");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("node event loop stopped");
        })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("state", &self.runtime.state())
            .finish_non_exhaustive()
    }
}

/// Run `job` every `interval` until shutdown. The first tick fires after
/// one full interval.
fn spawn_periodic<F, Fut>(
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => job().await,
                _ = shutdown.changed() => break,
            }
        }
    })
}
