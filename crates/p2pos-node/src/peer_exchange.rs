//! Peer exchange: learn the peers and observations other members hold.
//!
//! A responder shares its observed rows plus dialable addresses; the
//! periodic task merges fresh records into presence and dials newly
//! discovered peers. Stale offline records are not forwarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use p2pos_net::message::{self, ExchangeRecord, PeerExchangeResponse};
use p2pos_net::{DialTarget, PEER_EXCHANGE_ALPN, Transport};
use p2pos_cluster::RuntimeStateMachine;
use p2pos_store::PeerDb;
use p2pos_types::events::{EventBus, PeerStateObserved};
use p2pos_types::{Reachability, SharedClock};
use tracing::{debug, info};

use crate::error::NodeError;
use crate::marks::UnsupportedMarks;

/// How often connected peers are asked for their peer graph.
pub const PEER_EXCHANGE_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for one exchange stream.
const QUERY_TIMEOUT: Duration = Duration::from_secs(20);
/// Deadline for dialing one discovered peer.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Offline records older than this are considered stale and dropped.
const STALE_OFFLINE_TTL_MINUTES: i64 = 10;

/// Serves and consumes the peer-exchange protocol.
pub struct PeerExchangeService {
    runtime: Arc<RuntimeStateMachine>,
    transport: Arc<dyn Transport>,
    db: Arc<PeerDb>,
    bus: EventBus,
    clock: SharedClock,
    unsupported: UnsupportedMarks,
}

impl PeerExchangeService {
    /// Wire up the service.
    pub fn new(
        runtime: Arc<RuntimeStateMachine>,
        transport: Arc<dyn Transport>,
        db: Arc<PeerDb>,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            runtime,
            transport,
            db,
            bus,
            clock,
            unsupported: UnsupportedMarks::new(),
        }
    }

    /// The per-peer unsupported marks (cleared on connect events).
    pub fn unsupported(&self) -> &UnsupportedMarks {
        &self.unsupported
    }

    fn is_stale(&self, record: &ExchangeRecord) -> bool {
        record.row.reachability == Reachability::Offline
            && self.clock.now_utc() - record.updated_at
                > ChronoDuration::minutes(STALE_OFFLINE_TTL_MINUTES)
    }

    /// Answer one inbound exchange stream with the rows this node holds.
    pub fn handle(&self) -> PeerExchangeResponse {
        let rows = self.db.list().unwrap_or_default();
        let local = self.transport.local_peer_id();

        let mut peers = Vec::new();
        let mut records = Vec::new();
        for row in rows {
            let record = ExchangeRecord {
                updated_at: row.last_seen_at,
                row,
            };
            if self.is_stale(&record) {
                continue;
            }
            if record.row.peer_id != local && !record.row.last_remote_addr.is_empty() {
                peers.push(format!(
                    "{}@{}",
                    record.row.peer_id, record.row.last_remote_addr
                ));
            }
            records.push(record);
        }
        PeerExchangeResponse { peers, records }
    }

    /// One exchange round: query every connected peer, merge fresh
    /// records into presence and dial newly discovered addresses.
    pub async fn sync_once(&self) {
        if !self.runtime.can_use_business_protocols() {
            return;
        }
        let local = self.transport.local_peer_id();

        for peer in self.transport.connected_peers() {
            if self.unsupported.contains(&peer) {
                continue;
            }
            let resp = match self.query(&peer).await {
                Ok(resp) => resp,
                Err(NodeError::Net(err)) if err.is_protocol_unsupported() => {
                    info!(peer = %peer.fmt_short(), "peer exchange unsupported, marking peer");
                    self.unsupported.mark(peer);
                    continue;
                }
                Err(err) => {
                    debug!(peer = %peer.fmt_short(), %err, "peer exchange failed");
                    continue;
                }
            };

            for record in resp.records {
                if record.row.peer_id == local || self.is_stale(&record) {
                    continue;
                }
                self.bus.emit(PeerStateObserved {
                    row: record.row.clone(),
                    observed_at: record.updated_at,
                });
            }

            for addr in resp.peers {
                let Ok(target) = addr.parse::<DialTarget>() else {
                    continue;
                };
                if target.peer_id == local || self.transport.is_connected(&target.peer_id) {
                    continue;
                }
                if let Err(err) = self.transport.dial(&target, DIAL_TIMEOUT).await {
                    debug!(peer = %target.peer_id.fmt_short(), %err, "discovered peer dial failed");
                }
            }
        }
    }

    async fn query(
        &self,
        peer: &p2pos_types::PeerId,
    ) -> Result<PeerExchangeResponse, NodeError> {
        let bytes = self
            .transport
            .request(peer, PEER_EXCHANGE_ALPN, b"", QUERY_TIMEOUT)
            .await?;
        Ok(message::decode(&bytes)?)
    }
}

impl std::fmt::Debug for PeerExchangeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerExchangeService").finish_non_exhaustive()
    }
}
