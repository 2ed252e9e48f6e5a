//! The status protocol: per-node reachability views and their
//! cluster-wide aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use p2pos_cluster::{RuntimeState, RuntimeStateMachine};
use p2pos_net::message::{self, StatusRequest, StatusResponse, StatusScope};
use p2pos_net::{NetError, STATUS_ALPN, Transport};
use p2pos_store::PeerDb;
use p2pos_types::events::{EventBus, PeerStateObserved};
use p2pos_types::{PeerId, PeerRow, SharedClock};
use tracing::{debug, info};

use crate::error::NodeError;
use crate::marks::UnsupportedMarks;

/// Deadline for querying one remote peer.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers status queries and aggregates remote views.
pub struct StatusService {
    runtime: Arc<RuntimeStateMachine>,
    transport: Arc<dyn Transport>,
    db: Arc<PeerDb>,
    bus: EventBus,
    clock: SharedClock,
    unsupported: UnsupportedMarks,
}

impl StatusService {
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

    /// The local store's rows.
    pub fn local(&self) -> Result<Vec<PeerRow>, NodeError> {
        Ok(self.db.list()?)
    }

    /// The union of the local rows and every connected peer's `local`
    /// response, merged by peer id keeping the greatest `last_seen_at`.
    ///
    /// Remote rows additionally feed presence as observed state.
    pub async fn cluster(&self) -> Result<Vec<PeerRow>, NodeError> {
        let mut all = self.local()?;

        for peer in self.transport.connected_peers() {
            if self.unsupported.contains(&peer) {
                continue;
            }
            match self.fetch_local_of(&peer).await {
                Ok(rows) => {
                    for row in &rows {
                        self.bus.emit(PeerStateObserved {
                            row: row.clone(),
                            observed_at: row.last_seen_at,
                        });
                    }
                    all.extend(rows);
                }
                Err(NodeError::Net(err)) if err.is_protocol_unsupported() => {
                    info!(peer = %peer.fmt_short(), "status protocol unsupported, marking peer");
                    self.unsupported.mark(peer);
                }
                Err(err) => {
                    debug!(peer = %peer.fmt_short(), %err, "status query failed");
                }
            }
        }

        Ok(merge_rows(all))
    }

    /// Ask `peer` for its local status rows.
    pub async fn fetch_local_of(&self, peer: &PeerId) -> Result<Vec<PeerRow>, NodeError> {
        let req = message::encode(&StatusRequest {
            scope: StatusScope::Local,
        });
        let bytes = self
            .transport
            .request(peer, STATUS_ALPN, &req, QUERY_TIMEOUT)
            .await?;
        let resp: StatusResponse = message::decode(&bytes)?;
        if let Some(err) = resp.error {
            return Err(NetError::Remote(err).into());
        }
        Ok(resp.peers)
    }

    /// Answer one inbound status stream.
    pub async fn handle(&self, body: &[u8]) -> StatusResponse {
        let req: StatusRequest = message::decode(body).unwrap_or_default();
        let generated_at = self.clock.now_utc();

        if self.runtime.state() == RuntimeState::Unconfigured {
            return StatusResponse {
                generated_at,
                peers: Vec::new(),
                error: Some("node is unconfigured".to_string()),
            };
        }

        let result = match req.scope {
            StatusScope::Local => self.local(),
            StatusScope::Cluster => self.cluster().await,
        };
        match result {
            Ok(peers) => StatusResponse {
                generated_at,
                peers,
                error: None,
            },
            Err(err) => StatusResponse {
                generated_at,
                peers: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }
}

impl std::fmt::Debug for StatusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusService").finish_non_exhaustive()
    }
}

/// Merge rows by peer id, keeping the one with the greatest
/// `last_seen_at`; output sorted by peer id.
fn merge_rows(rows: Vec<PeerRow>) -> Vec<PeerRow> {
    let mut merged: BTreeMap<PeerId, PeerRow> = BTreeMap::new();
    for row in rows {
        match merged.get(&row.peer_id) {
            Some(existing) if existing.last_seen_at >= row.last_seen_at => {}
            _ => {
                merged.insert(row.peer_id, row);
            }
        }
    }
    merged.into_values().collect()
}
