//! Observed-peer store for P2POS.
//!
//! [`PeerDb`] keeps one [`PeerRow`](p2pos_types::PeerRow) per peer with
//! idempotent upsert/list/delete semantics. The presence adapter is its
//! single writer; the status protocol reads from it.

mod error;
mod store;

pub use error::StoreError;
pub use store::PeerDb;
