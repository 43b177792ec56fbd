//! Session registry — the set of sessions that completed their handshake.
//!
//! Membership changes and broadcast iteration share one mutex, so a
//! broadcast sees either the state before or after a concurrent join/leave,
//! never a torn one. The critical section only enqueues lines onto each
//! session's bounded outbound channel; it never waits on a socket. A session
//! whose queue is full is asked to close instead of being waited on.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

/// Opaque per-connection identifier, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One-shot request for a session to close because it fell behind.
#[derive(Debug, Default)]
pub struct Eviction {
    fired: AtomicBool,
    notify: Notify,
}

impl Eviction {
    /// Returns true only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_one();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once `fire` has been called.
    pub async fn fired(&self) {
        if self.is_fired() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Outcome of queueing one line for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue is at capacity; the session has been asked to close.
    Full,
    /// The session's writer is gone.
    Closed,
}

/// What the registry holds for one active session: its identity, the
/// sending end of its outbound line queue, and its eviction signal.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub name: String,
    pub peer_addr: SocketAddr,
    outbound: mpsc::Sender<String>,
    eviction: Arc<Eviction>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        name: String,
        peer_addr: SocketAddr,
        outbound: mpsc::Sender<String>,
        eviction: Arc<Eviction>,
    ) -> Self {
        Self {
            id,
            name,
            peer_addr,
            outbound,
            eviction,
        }
    }

    /// Queue a line for this session's writer. Never blocks. A full queue
    /// fires the session's eviction.
    pub fn send(&self, line: &str) -> Delivery {
        match self.outbound.try_send(line.to_string()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                if self.eviction.fire() {
                    tracing::warn!(
                        session = %self.id,
                        name = %self.name,
                        peer = %self.peer_addr,
                        "outbound queue full, dropping slow client"
                    );
                }
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Delivery capability that sessions and the dispatcher depend on.
///
/// `Registry` is the only implementation today; anything that can hold the
/// same membership guarantees (e.g. a sharded registry) can stand in for it
/// without touching session code.
pub trait Broadcaster: Send + Sync {
    /// Add an active session. Replaces any entry with the same id.
    fn register(&self, handle: SessionHandle);

    /// Remove a session. Returns the handle if it was still registered, so
    /// exactly one caller ever observes a given session leaving.
    fn remove(&self, id: SessionId) -> Option<SessionHandle>;

    /// Deliver `text` to every registered session except `exclude`.
    /// Per-recipient failures are logged and skipped. Returns the number of
    /// sessions the line was queued for.
    fn broadcast(&self, text: &str, exclude: Option<SessionId>) -> usize;

    /// Deliver `text` to every registered session.
    fn system_broadcast(&self, text: &str) -> usize {
        self.broadcast(text, None)
    }

    /// Number of registered sessions.
    fn count(&self) -> usize;
}

pub type SharedBroadcaster = Arc<dyn Broadcaster>;

#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Display names of everyone registered, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().values().map(|h| h.name.clone()).collect();
        names.sort();
        names
    }

    // Every mutation leaves the map consistent, so a poisoned lock is safe
    // to keep using.
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Broadcaster for Registry {
    fn register(&self, handle: SessionHandle) {
        let id = handle.id;
        let mut sessions = self.lock();
        let peer = handle.peer_addr;
        if sessions.insert(id, handle).is_some() {
            tracing::warn!(session = %id, "session registered twice, replacing entry");
        }
        tracing::debug!(session = %id, %peer, count = sessions.len(), "session registered");
    }

    fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        let mut sessions = self.lock();
        let removed = sessions.remove(&id);
        if let Some(handle) = &removed {
            tracing::debug!(
                session = %id,
                peer = %handle.peer_addr,
                count = sessions.len(),
                "session removed"
            );
        }
        removed
    }

    fn broadcast(&self, text: &str, exclude: Option<SessionId>) -> usize {
        let sessions = self.lock();
        let mut delivered = 0;
        for (id, handle) in sessions.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match handle.send(text) {
                Delivery::Queued => delivered += 1,
                Delivery::Full => {}
                Delivery::Closed => tracing::debug!(
                    session = %id,
                    name = %handle.name,
                    peer = %handle.peer_addr,
                    "recipient writer closed, skipping"
                ),
            }
        }
        delivered
    }

    fn count(&self) -> usize {
        self.lock().len()
    }
}
