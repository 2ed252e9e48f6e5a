//! The `keygen` subcommand: node, system and administrator key material.
//!
//! Prints `KEY=VALUE` lines on stdout so installers can capture them.
//! The system private key is printed once here and never stored on a
//! node; running nodes only ever see the public half plus signed proofs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use p2pos_cluster::{AdminProof, NodeKey};

/// Arguments of the `keygen` subcommand.
#[derive(Debug, Args)]
pub struct KeygenArgs {
    /// Also generate a system keypair and a signed admin proof.
    #[arg(long)]
    pub new_system: bool,

    /// Cluster id embedded in the admin proof.
    #[arg(long, default_value = "default")]
    pub cluster_id: String,

    /// Admin proof `valid_to` (RFC3339).
    #[arg(long, default_value = "9999-12-31T00:00:00Z")]
    pub admin_valid_to: String,

    /// Reuse an existing node private key (base64) instead of
    /// generating one.
    #[arg(long)]
    pub node_priv: Option<String>,
}

/// Run keygen and print the resulting material.
pub fn run(args: &KeygenArgs) -> Result<()> {
    let node_key = match &args.node_priv {
        Some(encoded) => NodeKey::from_base64(encoded).context("invalid --node-priv")?,
        None => NodeKey::generate(),
    };

    println!("NODE_PRIV_B64={}", node_key.to_base64());
    println!("NODE_PEER_ID={}", node_key.peer_id());

    if !args.new_system {
        return Ok(());
    }

    let system = NodeKey::generate();
    let admin = NodeKey::generate();

    let valid_from = Utc::now();
    let valid_to = parse_time(&args.admin_valid_to).context("invalid --admin-valid-to")?;
    let proof = AdminProof::issue(
        &args.cluster_id,
        admin.peer_id(),
        valid_from,
        valid_to,
        &system,
    );

    println!("SYSTEM_PRIV_B64={}", system.to_base64());
    println!("SYSTEM_PUB_B64={}", system.public_base64());
    println!("ADMIN_PRIV_B64={}", admin.to_base64());
    println!("ADMIN_PEER_ID={}", admin.peer_id());
    println!("ADMIN_PROOF_CLUSTER_ID={}", proof.cluster_id);
    println!("ADMIN_PROOF_PEER_ID={}", proof.peer_id);
    println!("ADMIN_PROOF_ROLE={}", proof.role);
    println!(
        "ADMIN_PROOF_VALID_FROM={}",
        p2pos_types::rfc3339_nanos(proof.valid_from)
    );
    println!(
        "ADMIN_PROOF_VALID_TO={}",
        p2pos_types::rfc3339_nanos(proof.valid_to)
    );
    println!("ADMIN_PROOF_SIG={}", proof.sig);

    Ok(())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())?;
    Ok(parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2pos_cluster::SystemKey;

    #[test]
    fn test_parse_time_accepts_rfc3339() {
        assert!(parse_time("9999-12-31T00:00:00Z").is_ok());
        assert!(parse_time("2026-02-21T11:11:01.508000000Z").is_ok());
        assert!(parse_time("next tuesday").is_err());
    }

    #[test]
    fn test_generated_proof_verifies_against_system_key() {
        let system = NodeKey::generate();
        let admin = NodeKey::generate();
        let now = Utc::now();
        let proof = AdminProof::issue(
            "default",
            admin.peer_id(),
            now,
            parse_time("9999-12-31T00:00:00Z").unwrap(),
            &system,
        );

        let system_pub = SystemKey::from_base64(&system.public_base64()).unwrap();
        proof
            .validate("default", &admin.peer_id(), &system_pub, now)
            .unwrap();
    }

    #[test]
    fn test_existing_node_key_reused() {
        let key = NodeKey::generate();
        let args = KeygenArgs {
            new_system: false,
            cluster_id: "default".to_string(),
            admin_valid_to: "9999-12-31T00:00:00Z".to_string(),
            node_priv: Some(key.to_base64()),
        };
        run(&args).unwrap();

        let restored = NodeKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(restored.peer_id(), key.peer_id());
    }
}
