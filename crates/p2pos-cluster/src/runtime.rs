//! The process-wide runtime state machine.
//!
//! State is `unconfigured` / `degraded` / `healthy`, mutated only through
//! [`evaluate`](RuntimeStateMachine::evaluate) and read as a lock-free
//! snapshot. Transitions are serialized by an internal mutex so observers
//! never see a stale value after `evaluate` returns.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use p2pos_types::PeerId;
use tracing::info;

use crate::manager::MembershipManager;

/// Runtime state of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    /// Not part of any cluster yet. Business protocols refused; only
    /// bootstrap dialing and membership pull/push remain available.
    Unconfigured = 0,
    /// A member, but without quorum. Read-only protocols enabled.
    Degraded = 1,
    /// A member with quorum. All protocols enabled, including publish.
    Healthy = 2,
}

impl RuntimeState {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => RuntimeState::Healthy,
            1 => RuntimeState::Degraded,
            _ => RuntimeState::Unconfigured,
        }
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Unconfigured => write!(f, "unconfigured"),
            RuntimeState::Degraded => write!(f, "degraded"),
            RuntimeState::Healthy => write!(f, "healthy"),
        }
    }
}

/// Computes and holds the runtime state; the single owner of transitions.
pub struct RuntimeStateMachine {
    manager: Arc<MembershipManager>,
    state: AtomicU8,
    transition: Mutex<()>,
}

impl RuntimeStateMachine {
    /// Start in `unconfigured`.
    pub fn new(manager: Arc<MembershipManager>) -> Self {
        Self {
            manager,
            state: AtomicU8::new(RuntimeState::Unconfigured as u8),
            transition: Mutex::new(()),
        }
    }

    /// Current state (lock-free read).
    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether heartbeat, status and peer-exchange streams are admitted.
    pub fn can_use_business_protocols(&self) -> bool {
        self.state() != RuntimeState::Unconfigured
    }

    /// Whether the administrator publish operation is admitted.
    pub fn can_publish(&self) -> bool {
        self.state() == RuntimeState::Healthy
    }

    /// Whether an inbound connection from `peer` is admitted.
    ///
    /// While `unconfigured` every peer is allowed, so a non-member can
    /// still deliver the membership push that adds the local node.
    pub fn allow_peer(&self, peer: &PeerId) -> bool {
        self.state() == RuntimeState::Unconfigured || self.manager.is_member(peer)
    }

    /// Recompute the state from the member set and the given connected
    /// peers. `2k > N` with `k` observed-online members (self counted)
    /// means `healthy`; quorum inputs are read atomically under the
    /// manager lock.
    pub fn evaluate(&self, connected: &[PeerId], reason: &str) {
        let _serialized = self.transition.lock().expect("transition lock");

        let view = self.manager.quorum_view(connected);
        let (next, detail) = if !view.local_is_member {
            (RuntimeState::Unconfigured, "local-not-member")
        } else if view.member_count == 0 {
            (RuntimeState::Unconfigured, "member-set-empty")
        } else if view.online * 2 > view.member_count {
            (RuntimeState::Healthy, "quorum")
        } else {
            (RuntimeState::Degraded, "no-quorum")
        };

        let prev = RuntimeState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            info!(
                prev = %prev,
                next = %next,
                reason = format!("{reason}:{detail}"),
                peer_id = %self.manager.local_peer(),
                cluster_id = self.manager.cluster_id(),
                "runtime state changed"
            );
        }
    }
}

impl std::fmt::Debug for RuntimeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeStateMachine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
