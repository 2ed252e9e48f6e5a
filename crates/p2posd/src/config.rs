//! JSON configuration for the P2POS daemon.
//!
//! The configuration file is the single source of identity: the node's
//! private key and the last applied member list are persisted back into
//! it. No secret material ever lands in the peer store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use p2pos_cluster::{AdminProof, NodeKey};
use p2pos_node::bootstrap::{SeedEntry, SeedKind};
use p2pos_types::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default port for the auto-TLS listener when the configured one is
/// invalid.
pub const DEFAULT_AUTO_TLS_PORT: i64 = 4101;

/// One configured seed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InitConnection {
    /// `"dns"` or `"multiaddr"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Domain name or literal `<peer_id>@host:port` address.
    pub address: String,
}

/// `auto_tls` section. The core consumes only `mode` and `port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTls {
    /// `auto` | `on` | `off`; invalid values fall back to `auto`.
    pub mode: String,
    /// Listener port; values ≤ 0 fall back to 4101.
    pub port: i64,
    /// Certificate cache directory (opaque to the core).
    pub cache_dir: String,
    /// Account email (opaque to the core).
    pub user_email: String,
    /// Registration token (opaque to the core).
    pub forge_auth: String,
}

impl Default for AutoTls {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            port: DEFAULT_AUTO_TLS_PORT,
            cache_dir: String::new(),
            user_email: String::new(),
            forge_auth: String::new(),
        }
    }
}

/// The daemon configuration, parsed from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Seed entries the bootstrap loop dials.
    pub init_connections: Vec<InitConnection>,
    /// `host:port` listen entries; the transport expands each into TCP
    /// and QUIC listeners on both address families.
    pub listen: Vec<String>,
    /// `auto` | `public` | `private`; invalid values fall back to `auto`.
    pub network_mode: String,
    /// Auto-TLS settings.
    pub auto_tls: AutoTls,
    /// Cluster identifier; empty falls back to `"default"`.
    pub cluster_id: String,
    /// Base64 ed25519 system public key; empty disables proof checks.
    pub system_pubkey: String,
    /// Base64 32-byte node key seed; generated on first run.
    pub node_private_key: String,
    /// Initial member list (peer id strings).
    pub members: Vec<String>,
    /// Administrator credential, present only on admin nodes.
    pub admin_proof: Option<AdminProof>,
    /// Consumed by the self-update subsystem, opaque to the core.
    pub update_feed_url: String,
}

impl Config {
    /// Apply the documented fallbacks in place.
    pub fn normalize(&mut self) {
        match self.network_mode.trim().to_lowercase().as_str() {
            "public" => self.network_mode = "public".to_string(),
            "private" => self.network_mode = "private".to_string(),
            _ => self.network_mode = "auto".to_string(),
        }
        match self.auto_tls.mode.trim().to_lowercase().as_str() {
            "on" => self.auto_tls.mode = "on".to_string(),
            "off" => self.auto_tls.mode = "off".to_string(),
            _ => self.auto_tls.mode = "auto".to_string(),
        }
        if self.auto_tls.port <= 0 {
            self.auto_tls.port = DEFAULT_AUTO_TLS_PORT;
        }
        if self.cluster_id.trim().is_empty() {
            self.cluster_id = "default".to_string();
        } else {
            self.cluster_id = self.cluster_id.trim().to_string();
        }

        let mut seen = BTreeSet::new();
        self.members = self
            .members
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .filter(|m| seen.insert(m.clone()))
            .collect();
    }

    /// Validate the parts that are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        for conn in &self.init_connections {
            match conn.kind.as_str() {
                "dns" | "multiaddr" => {}
                other => anyhow::bail!("invalid init_connection type {other:?}"),
            }
            if conn.address.trim().is_empty() {
                anyhow::bail!("init_connection with empty address");
            }
        }
        for listen in &self.listen {
            listen_port(listen)
                .with_context(|| format!("invalid listen address {listen:?}"))?;
        }
        Ok(())
    }

    /// The configured members as typed peer ids.
    pub fn member_ids(&self) -> Result<Vec<PeerId>> {
        self.members
            .iter()
            .map(|m| {
                m.parse::<PeerId>()
                    .with_context(|| format!("invalid member peer id {m:?}"))
            })
            .collect()
    }

    /// Seed entries for the bootstrap loop.
    pub fn seed_entries(&self) -> Vec<SeedEntry> {
        self.init_connections
            .iter()
            .map(|conn| SeedEntry {
                kind: match conn.kind.as_str() {
                    "dns" => SeedKind::Dns,
                    _ => SeedKind::Multiaddr,
                },
                address: conn.address.trim().to_string(),
            })
            .collect()
    }

    /// Whether the transport should use the relay infrastructure.
    pub fn relay_enabled(&self) -> bool {
        self.network_mode != "private"
    }

    /// The port the transport listens on (first `listen` entry, 4100
    /// when none is configured).
    pub fn listen_port_or_default(&self) -> u16 {
        self.listen
            .first()
            .and_then(|l| listen_port(l).ok())
            .unwrap_or(4100)
    }
}

/// Parse the port out of a `host:port`, `[v6]:port` or bare-port entry.
fn listen_port(listen: &str) -> Result<u16> {
    let listen = listen.trim();
    if listen.is_empty() {
        anyhow::bail!("empty listen entry");
    }
    let port_str = match listen.rfind(':') {
        Some(idx) => &listen[idx + 1..],
        None => listen,
    };
    port_str
        .parse::<u16>()
        .with_context(|| format!("invalid port {port_str:?}"))
}

/// Owns the configuration file: loads it once, serves copies, persists
/// identity and membership changes back.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Config>,
}

impl ConfigStore {
    /// Load and normalize the configuration file. Missing or malformed
    /// files are fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.normalize();
        config.validate()?;
        Ok(Self {
            path,
            inner: RwLock::new(config),
        })
    }

    /// A copy of the current configuration.
    pub fn get(&self) -> Config {
        self.inner.read().expect("config lock").clone()
    }

    /// Load the node key from the configuration, generating and
    /// persisting a fresh one when it is missing or unparseable.
    pub fn ensure_node_key(&self) -> Result<NodeKey> {
        let stored = self.get().node_private_key;
        if !stored.trim().is_empty() {
            match NodeKey::from_base64(&stored) {
                Ok(key) => {
                    info!(peer_id = %key.peer_id().fmt_short(), "loaded node key");
                    return Ok(key);
                }
                Err(err) => {
                    warn!(%err, "stored node key invalid, generating a fresh one");
                }
            }
        }

        let key = NodeKey::generate();
        {
            let mut inner = self.inner.write().expect("config lock");
            inner.node_private_key = key.to_base64();
        }
        self.persist()?;
        info!(peer_id = %key.peer_id().fmt_short(), "generated and persisted new node key");
        Ok(key)
    }

    /// Persist an applied member list back into the file.
    pub fn persist_members(&self, members: &[PeerId]) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("config lock");
            inner.members = members.iter().map(PeerId::to_string).collect();
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let config = self.get();
        let json = serde_json::to_string_pretty(&config)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write config {}", self.path.display()))
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
