//! Bootstrap seed resolution tests with a mocked DNS resolver.

use std::collections::HashMap;
use std::sync::Arc;

use p2pos_types::PeerId;

use crate::NodeError;
use crate::bootstrap::{SeedEntry, SeedKind, SeedResolver, TxtResolver, parse_txt_record};

struct MockTxtResolver {
    records: HashMap<String, Vec<String>>,
}

impl MockTxtResolver {
    fn new(entries: &[(&str, &[&str])]) -> Arc<Self> {
        let mut records = HashMap::new();
        for (name, values) in entries {
            records.insert(
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            );
        }
        Arc::new(Self { records })
    }
}

#[async_trait::async_trait]
impl TxtResolver for MockTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, NodeError> {
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| NodeError::Resolve(format!("NXDOMAIN {name}")))
    }
}

fn peer(n: u8) -> PeerId {
    PeerId::from([n; 32])
}

// ---------------------------------------------------------------------------
// TXT record parsing
// ---------------------------------------------------------------------------

#[test]
fn test_parse_txt_record_variants() {
    let id = peer(1);
    let addr = format!("{id}@192.0.2.1:4100");

    assert_eq!(parse_txt_record(&addr), Some(addr.clone()));
    assert_eq!(parse_txt_record(&format!("dnsaddr={addr}")), Some(addr.clone()));
    assert_eq!(
        parse_txt_record(&format!("dnsaddr=\"{addr}\"")),
        Some(addr.clone())
    );
    assert_eq!(parse_txt_record(&format!("  \"{addr}\"  ")), Some(addr));
    assert_eq!(parse_txt_record(""), None);
    assert_eq!(parse_txt_record("dnsaddr="), None);
    assert_eq!(parse_txt_record("\"\""), None);
}

// ---------------------------------------------------------------------------
// Seed resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dns_seed_prefers_dnsaddr_subdomain() {
    let seed_peer = peer(2);
    let dns = MockTxtResolver::new(&[
        (
            "_dnsaddr.cluster.example",
            &[&format!("dnsaddr={seed_peer}@192.0.2.2:4100") as &str],
        ),
        ("cluster.example", &[&format!("{}@198.51.100.9:9", peer(9)) as &str]),
    ]);
    let resolver = SeedResolver::new(
        peer(1),
        vec![SeedEntry {
            kind: SeedKind::Dns,
            address: "cluster.example".to_string(),
        }],
        dns,
    );

    let targets = resolver.resolve().await;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].peer_id, seed_peer);
    assert_eq!(targets[0].addrs, vec!["192.0.2.2:4100".parse().unwrap()]);
}

#[tokio::test]
async fn test_dns_seed_falls_back_to_bare_domain() {
    let seed_peer = peer(3);
    let dns = MockTxtResolver::new(&[(
        "cluster.example",
        &[&format!("{seed_peer}@192.0.2.3:4100") as &str],
    )]);
    let resolver = SeedResolver::new(
        peer(1),
        vec![SeedEntry {
            kind: SeedKind::Dns,
            address: "cluster.example".to_string(),
        }],
        dns,
    );

    let targets = resolver.resolve().await;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].peer_id, seed_peer);
}

#[tokio::test]
async fn test_candidates_merge_by_peer_id() {
    let seed_peer = peer(4);
    let dns = MockTxtResolver::new(&[(
        "_dnsaddr.cluster.example",
        &[
            &format!("dnsaddr={seed_peer}@192.0.2.4:4100") as &str,
            &format!("dnsaddr={seed_peer}@[2001:db8::4]:4100") as &str,
        ],
    )]);
    let resolver = SeedResolver::new(
        peer(1),
        vec![
            SeedEntry {
                kind: SeedKind::Dns,
                address: "cluster.example".to_string(),
            },
            // The same peer again as a literal seed with a third address.
            SeedEntry {
                kind: SeedKind::Multiaddr,
                address: format!("{seed_peer}@203.0.113.4:4100"),
            },
        ],
        dns,
    );

    let targets = resolver.resolve().await;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].addrs.len(), 3);
}

#[tokio::test]
async fn test_own_peer_id_is_skipped() {
    let local = peer(1);
    let dns = MockTxtResolver::new(&[]);
    let resolver = SeedResolver::new(
        local,
        vec![SeedEntry {
            kind: SeedKind::Multiaddr,
            address: format!("{local}@192.0.2.1:4100"),
        }],
        dns,
    );

    assert!(resolver.resolve().await.is_empty());
}

#[tokio::test]
async fn test_invalid_entries_are_skipped_not_fatal() {
    let seed_peer = peer(5);
    let dns = MockTxtResolver::new(&[(
        "_dnsaddr.cluster.example",
        &[
            "dnsaddr=garbage",
            &format!("dnsaddr={seed_peer}@192.0.2.5:4100") as &str,
        ],
    )]);
    let resolver = SeedResolver::new(
        peer(1),
        vec![
            SeedEntry {
                kind: SeedKind::Multiaddr,
                address: "not-a-target".to_string(),
            },
            SeedEntry {
                kind: SeedKind::Dns,
                address: "cluster.example".to_string(),
            },
        ],
        dns,
    );

    let targets = resolver.resolve().await;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].peer_id, seed_peer);
}

#[tokio::test]
async fn test_failed_dns_seed_is_skipped() {
    let seed_peer = peer(6);
    let dns = MockTxtResolver::new(&[]);
    let resolver = SeedResolver::new(
        peer(1),
        vec![
            SeedEntry {
                kind: SeedKind::Dns,
                address: "missing.example".to_string(),
            },
            SeedEntry {
                kind: SeedKind::Multiaddr,
                address: format!("{seed_peer}@192.0.2.6:4100"),
            },
        ],
        dns,
    );

    let targets = resolver.resolve().await;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].peer_id, seed_peer);
}
