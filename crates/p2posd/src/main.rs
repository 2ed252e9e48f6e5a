//! `p2posd` — the P2POS daemon.
//!
//! Binary entrypoint: loads the JSON configuration, derives the node
//! identity, binds the iroh endpoint, registers the protocol handlers
//! and runs the cluster runtime until a shutdown signal arrives.
//!
//! # Usage
//!
//! ```text
//! p2posd                         # run the node with ./p2pos.json
//! p2posd -c /etc/p2pos.json      # run with an explicit config file
//! p2posd keygen                  # generate a node keypair
//! p2posd keygen --new-system     # plus system keypair and admin proof
//! ```

mod config;
mod keygen;
mod telemetry;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iroh::protocol::Router;
use iroh::{Endpoint, RelayMode, SecretKey};
use p2pos_node::bootstrap::{self, HickoryTxtResolver, SeedResolver};
use p2pos_node::handlers::{
    Admission, HeartbeatHandler, MembershipFetchHandler, MembershipPushHandler,
    PeerExchangeHandler, StatusHandler,
};
use p2pos_node::Node;
use p2pos_cluster::MembershipManager;
use p2pos_net::{
    ALL_ALPNS, ConnectionRegistry, HEARTBEAT_ALPN, IrohTransport, MEMBERSHIP_ALPN,
    MEMBERSHIP_PUSH_ALPN, PEER_EXCHANGE_ALPN, STATUS_ALPN, Transport,
};
use p2pos_store::PeerDb;
use p2pos_types::events::{EventBus, MembershipApplied, ShutdownRequested};
use p2pos_types::{SharedClock, SystemClock};
use tokio::sync::watch;
use tracing::{info, warn};

use config::ConfigStore;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "p2posd",
    version,
    about = "P2POS self-organizing peer-to-peer cluster daemon"
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(short, long, global = true, default_value = "p2pos.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate node and (optionally) system/administrator key material.
    Keygen(keygen::KeygenArgs),
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Keygen(args)) => keygen::run(&args),
        None => {
            telemetry::init("info");
            cmd_run(&cli.config).await
        }
    }
}

// -----------------------------------------------------------------------
// p2posd (run the node)
// -----------------------------------------------------------------------

async fn cmd_run(config_path: &Path) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting p2posd");

    let store = Arc::new(ConfigStore::load(config_path)?);
    let cfg = store.get();
    info!(
        cluster_id = %cfg.cluster_id,
        network_mode = %cfg.network_mode,
        auto_tls_mode = %cfg.auto_tls.mode,
        auto_tls_port = cfg.auto_tls.port,
        seeds = cfg.init_connections.len(),
        "node configuration"
    );

    // --- Node identity ---
    let node_key = store.ensure_node_key()?;
    let local_peer = node_key.peer_id();
    info!(peer_id = %local_peer, "node identity");

    // --- Membership manager ---
    let clock: SharedClock = Arc::new(SystemClock);
    let system_pubkey = (!cfg.system_pubkey.trim().is_empty()).then_some(cfg.system_pubkey.as_str());
    let manager = Arc::new(
        MembershipManager::new(
            &cfg.cluster_id,
            system_pubkey,
            local_peer,
            cfg.member_ids()?,
            clock.clone(),
        )
        .context("failed to build membership manager")?,
    );

    // --- Admission of the local admin credential ---
    // The proof must name this node and verify against the system key,
    // otherwise startup fails.
    if let Some(proof) = &cfg.admin_proof {
        anyhow::ensure!(
            proof.peer_id == local_peer,
            "admin_proof peer_id does not match local peer_id"
        );
        manager
            .validate_admin_proof(proof, &proof.peer_id)
            .context("configured admin_proof is invalid")?;
        info!("administrator credential validated");
    }

    // --- Event bus and connection registry ---
    let bus = EventBus::new();
    let registry = ConnectionRegistry::new(bus.clone());

    // --- Transport (iroh QUIC) ---
    let port = cfg.listen_port_or_default();
    let relay = cfg.relay_enabled();
    let endpoint = Endpoint::builder()
        .secret_key(SecretKey::from_bytes(&node_key.seed_bytes()))
        .alpns(ALL_ALPNS.iter().map(|a| a.to_vec()).collect())
        .relay_mode(if relay {
            RelayMode::Default
        } else {
            RelayMode::Disabled
        })
        .bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .bind_addr_v6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
        .bind()
        .await
        .context("failed to bind iroh endpoint")?;
    let transport: Arc<IrohTransport> =
        Arc::new(IrohTransport::from_endpoint(endpoint.clone(), registry.clone()));
    info!(port, relay, endpoint_id = %endpoint.node_id().fmt_short(), "transport ready");
    for addr in endpoint.bound_sockets() {
        info!(%addr, "listening on");
    }

    // --- Observed-peer store ---
    let db_path = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("p2pos.db");
    let db = Arc::new(PeerDb::open(&db_path).context("failed to open peer store")?);

    // --- Runtime services ---
    let node = Node::new(
        manager.clone(),
        transport.clone() as Arc<dyn Transport>,
        bus.clone(),
        db,
        clock.clone(),
        node_key,
        cfg.admin_proof.clone(),
    );

    // --- Inbound protocol handlers ---
    let admission = Admission::new(node.runtime.clone(), registry);
    let router = Router::builder(endpoint.clone())
        .accept(
            MEMBERSHIP_ALPN,
            MembershipFetchHandler {
                service: node.membership.clone(),
                admission: admission.clone(),
            },
        )
        .accept(
            MEMBERSHIP_PUSH_ALPN,
            MembershipPushHandler {
                service: node.membership.clone(),
                admission: admission.clone(),
            },
        )
        .accept(
            HEARTBEAT_ALPN,
            HeartbeatHandler {
                service: node.heartbeat.clone(),
                admission: admission.clone(),
            },
        )
        .accept(
            STATUS_ALPN,
            StatusHandler {
                service: node.status.clone(),
                admission: admission.clone(),
            },
        )
        .accept(
            PEER_EXCHANGE_ALPN,
            PeerExchangeHandler {
                service: node.exchange.clone(),
                admission,
            },
        )
        .spawn();

    // --- Shutdown plumbing ---
    // Subscribe before the signal bridge is spawned so no request is lost.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut shutdown_events = bus.subscribe::<ShutdownRequested>();
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            let reason = shutdown_signal().await;
            bus.emit(ShutdownRequested { reason });
        });
    }

    // --- Persist applied member lists back into the config file ---
    {
        let store = store.clone();
        let mut applied_rx = bus.subscribe::<MembershipApplied>();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = applied_rx.recv() => {
                        let Some(event) = event else { break };
                        if let Err(err) = store.persist_members(&event.members) {
                            warn!(%err, "failed to persist members");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // --- Periodic tasks and the bootstrap loop ---
    let mut tasks = node.start(shutdown_rx.clone());
    let dns = Arc::new(HickoryTxtResolver::from_system().context("failed to build DNS resolver")?);
    let resolver = SeedResolver::new(local_peer, cfg.seed_entries(), dns);
    tasks.push(bootstrap::start(
        resolver,
        transport.clone() as Arc<dyn Transport>,
        node.runtime.clone(),
        shutdown_rx.clone(),
    ));

    // --- Run until shutdown is requested ---
    if let Some(request) = shutdown_events.recv().await {
        info!(reason = %request.reason, "shutdown requested");
    }
    let _ = shutdown_tx.send(true);

    // Scheduler tasks first, then runtime services, transport last.
    for task in tasks {
        let _ = task.await;
    }
    info!("shutting down router");
    router.shutdown().await.context("router shutdown failed")?;
    transport.close().await;

    info!("shutdown complete");
    Ok(())
}

// -----------------------------------------------------------------------
// Signal handling
// -----------------------------------------------------------------------

/// Wait for SIGINT (Ctrl-C) or SIGTERM and return the reason string.
///
/// A second signal during shutdown forces an immediate exit.
async fn shutdown_signal() -> String {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        () = ctrl_c => "signal:SIGINT".to_string(),
        () = terminate => "signal:SIGTERM".to_string(),
    };

    // Force exit on a second signal.
    tokio::spawn(async {
        let second = async {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install second SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            #[cfg(not(unix))]
            {
                ctrl_c.await.ok();
            }
        };
        second.await;
        warn!("received second signal during shutdown, forcing exit");
        std::process::exit(1);
    });

    reason
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["p2posd"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("p2pos.json"));
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::try_parse_from(["p2posd", "-c", "/etc/p2pos.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/p2pos.json"));
    }

    #[test]
    fn test_cli_keygen_subcommand() {
        let cli = Cli::try_parse_from(["p2posd", "keygen", "--new-system"]).unwrap();
        match cli.command {
            Some(Commands::Keygen(args)) => {
                assert!(args.new_system);
                assert_eq!(args.cluster_id, "default");
                assert_eq!(args.admin_valid_to, "9999-12-31T00:00:00Z");
            }
            _ => panic!("expected keygen subcommand"),
        }
    }
}
