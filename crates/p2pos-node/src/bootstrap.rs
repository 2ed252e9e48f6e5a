//! Bootstrap: resolve configured seeds and dial until connected.
//!
//! Seeds are either literal dial targets or DNS names whose TXT records
//! (under `_dnsaddr.<domain>`, falling back to `<domain>`) carry
//! `dnsaddr=<peer_id>@host:port` entries. Candidates that resolve to the
//! same peer id are merged into one target with the union of addresses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use p2pos_cluster::RuntimeStateMachine;
use p2pos_net::{DialTarget, Transport};
use p2pos_types::PeerId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NodeError;

/// How often the loop retries while unconnected or unconfigured.
pub const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for dialing one candidate.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of a configured seed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    /// A DNS name resolved via TXT lookup.
    Dns,
    /// A literal `<peer_id>@host:port` (or bare `<peer_id>`) address.
    Multiaddr,
}

/// One configured seed.
#[derive(Debug, Clone)]
pub struct SeedEntry {
    /// How to interpret `address`.
    pub kind: SeedKind,
    /// The seed address or domain.
    pub address: String,
}

/// Capability interface for DNS TXT lookups; mocked in tests.
#[async_trait::async_trait]
pub trait TxtResolver: Send + Sync {
    /// All TXT record strings under `name`.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, NodeError>;
}

/// TXT resolver backed by hickory using the system configuration.
pub struct HickoryTxtResolver {
    resolver: hickory_resolver::TokioAsyncResolver,
}

impl HickoryTxtResolver {
    /// Build a resolver from `/etc/resolv.conf`.
    pub fn from_system() -> Result<Self, NodeError> {
        let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| NodeError::Resolve(e.to_string()))?;
        Ok(Self { resolver })
    }
}

#[async_trait::async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, NodeError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| NodeError::Resolve(e.to_string()))?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .collect())
    }
}

/// Strip the `dnsaddr=` prefix and optional surrounding quotes from a
/// TXT record value. Returns `None` for empty records.
pub fn parse_txt_record(raw: &str) -> Option<String> {
    let mut value = raw.trim();
    if let Some(rest) = value.strip_prefix("dnsaddr=") {
        value = rest.trim();
    }
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value = value[1..value.len() - 1].trim();
    }
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Resolves the configured seeds into dial targets.
pub struct SeedResolver {
    local: PeerId,
    seeds: Vec<SeedEntry>,
    dns: Arc<dyn TxtResolver>,
}

impl SeedResolver {
    /// Build a resolver for the given seeds. The local peer id is
    /// excluded from every result.
    pub fn new(local: PeerId, seeds: Vec<SeedEntry>, dns: Arc<dyn TxtResolver>) -> Self {
        Self { local, seeds, dns }
    }

    /// Resolve every seed, merging candidates by peer id.
    pub async fn resolve(&self) -> Vec<DialTarget> {
        let mut by_peer: BTreeMap<PeerId, DialTarget> = BTreeMap::new();

        for seed in &self.seeds {
            match seed.kind {
                SeedKind::Dns => {
                    let records = match self.lookup_seed_txt(&seed.address).await {
                        Ok(records) => records,
                        Err(err) => {
                            warn!(domain = %seed.address, %err, "dns seed lookup failed");
                            continue;
                        }
                    };
                    for record in records {
                        let Some(value) = parse_txt_record(&record) else {
                            continue;
                        };
                        match value.parse::<DialTarget>() {
                            Ok(target) => merge_target(&mut by_peer, target, self.local),
                            Err(err) => {
                                warn!(domain = %seed.address, record = %value, %err, "dns seed record invalid");
                            }
                        }
                    }
                }
                SeedKind::Multiaddr => match seed.address.parse::<DialTarget>() {
                    Ok(target) => merge_target(&mut by_peer, target, self.local),
                    Err(err) => {
                        warn!(address = %seed.address, %err, "seed address invalid");
                    }
                },
            }
        }

        by_peer.into_values().collect()
    }

    /// TXT records live under `_dnsaddr.<domain>`; fall back to the bare
    /// domain for older deployments.
    async fn lookup_seed_txt(&self, domain: &str) -> Result<Vec<String>, NodeError> {
        let base = domain.trim().trim_end_matches('.');
        if base.is_empty() {
            return Err(NodeError::Resolve("empty dns bootstrap domain".to_string()));
        }

        if !base.starts_with("_dnsaddr.") {
            let prefixed = format!("_dnsaddr.{base}");
            if let Ok(records) = self.dns.lookup_txt(&prefixed).await
                && !records.is_empty()
            {
                return Ok(records);
            }
        }
        self.dns.lookup_txt(base).await
    }
}

fn merge_target(by_peer: &mut BTreeMap<PeerId, DialTarget>, target: DialTarget, local: PeerId) {
    if target.peer_id == local {
        return;
    }
    let entry = by_peer
        .entry(target.peer_id)
        .or_insert_with(|| DialTarget::new(target.peer_id));
    for addr in target.addrs {
        entry.merge_addr(addr);
    }
}

/// Run the bootstrap loop until the node is both connected and
/// configured, or shutdown is requested.
///
/// Every round: if a peer is connected and the runtime has left
/// `unconfigured`, stop. Otherwise resolve the seeds and dial candidates
/// in sequence until one succeeds. While still `unconfigured` the loop
/// keeps running so a membership push can reach us.
pub fn start(
    resolver: SeedResolver,
    transport: Arc<dyn Transport>,
    runtime: Arc<RuntimeStateMachine>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BOOTSTRAP_INTERVAL);
        loop {
            // First tick fires immediately.
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }

            if runtime.can_use_business_protocols()
                && !transport.connected_peers().is_empty()
            {
                info!("peer connected and membership configured, stopping bootstrap");
                return;
            }

            let candidates = resolver.resolve().await;
            if candidates.is_empty() {
                debug!("no bootstrap candidates resolved");
                continue;
            }

            for candidate in &candidates {
                if transport.is_connected(&candidate.peer_id) {
                    continue;
                }
                match transport.dial(candidate, DIAL_TIMEOUT).await {
                    Ok(()) => {
                        info!(peer = %candidate.peer_id.fmt_short(), "connected to bootstrap peer");
                        break;
                    }
                    Err(err) => {
                        debug!(peer = %candidate.peer_id.fmt_short(), %err, "bootstrap dial failed");
                    }
                }
            }
        }
    })
}
