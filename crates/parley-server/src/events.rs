//! Membership events — who joined and who left, for embedding programs
//! that present the roster (a status line, an admin view, a log pane).

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::registry::SessionId;
use crate::session::CloseReason;

/// Events buffered per subscriber before it starts lagging.
pub const MEMBERSHIP_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined {
        id: SessionId,
        name: String,
        peer_addr: SocketAddr,
    },
    Left {
        id: SessionId,
        name: String,
        reason: LeaveReason,
    },
}

/// How an active participant went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Exit,
    Disconnected,
    /// Dropped for not reading its messages fast enough.
    TooSlow,
    Shutdown,
}

impl From<&CloseReason> for LeaveReason {
    fn from(reason: &CloseReason) -> Self {
        match reason {
            CloseReason::Exit => LeaveReason::Exit,
            CloseReason::Evicted => LeaveReason::TooSlow,
            CloseReason::Shutdown => LeaveReason::Shutdown,
            CloseReason::PeerClosed
            | CloseReason::Transport(_)
            | CloseReason::HandshakeRejected(_)
            | CloseReason::HandshakeTimeout => LeaveReason::Disconnected,
        }
    }
}

/// Publishing side of the membership feed. Cloned into every session.
#[derive(Debug, Clone)]
pub struct MembershipEvents(broadcast::Sender<MembershipEvent>);

impl MembershipEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMBERSHIP_EVENT_CAPACITY);
        Self(tx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.0.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: MembershipEvent) {
        let _ = self.0.send(event);
    }
}

impl Default for MembershipEvents {
    fn default() -> Self {
        Self::new()
    }
}
