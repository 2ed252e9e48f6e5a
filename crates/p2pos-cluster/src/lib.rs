//! Cluster control core for P2POS.
//!
//! This crate holds the pieces the rest of the node agrees on:
//!
//! - [`NodeKey`] / [`SystemKey`] — ed25519 key material and the stable
//!   [`PeerId`](p2pos_types::PeerId) derived from it.
//! - [`AdminProof`] — the time-bounded, system-signed capability binding one
//!   peer id to the `admin` role.
//! - [`Snapshot`] — the signed, monotonically versioned member list.
//! - [`MembershipManager`] — validates and applies snapshots, answers
//!   membership queries.
//! - [`RuntimeStateMachine`] — computes `unconfigured`/`degraded`/`healthy`
//!   and gates protocol admission.

mod error;
mod identity;
mod manager;
mod proof;
mod runtime;
mod snapshot;


pub use error::ClusterError;
pub use identity::{NodeKey, SystemKey, verify_from_peer, verifying_key_of};
pub use manager::{Applied, MembershipManager, QuorumView};
pub use proof::{ADMIN_ROLE, AdminProof};
pub use runtime::{RuntimeState, RuntimeStateMachine};
pub use snapshot::{Snapshot, normalize_members, sign_snapshot};
