//! Server-side session — the handshake state machine and read loop for one
//! connection.
//!
//! ```text
//!  AwaitingName ──name──▶ Active ──exit / EOF / error / shutdown──▶ Closed
//!       │                                                            ▲
//!       └──────── empty name / EOF / timeout / shutdown ─────────────┘
//! ```
//!
//! A session owns its transport. The read half stays with the session task;
//! the write half moves into a writer task fed by a bounded queue, which is
//! what the broadcaster pushes into. When that queue fills up the session is
//! evicted and closes like any other departure.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;

use parley_core::config::ServerConfig;
use parley_core::message::{join_notice, leave_notice, Message};
use parley_core::wire::{self, DEFAULT_MAX_LINE_BYTES};

use crate::events::{LeaveReason, MembershipEvent, MembershipEvents};
use crate::registry::{Eviction, SessionHandle, SessionId, SharedBroadcaster};

const INVALID_NAME: &str = "Invalid username. Connection closed.";
const HANDSHAKE_TIMED_OUT: &str = "Handshake timed out. Connection closed.";

/// Bound on flushing queued lines once a session has closed.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// `None` waits for the name forever.
    pub handshake_timeout: Option<Duration>,
    pub max_line_bytes: usize,
    /// Lines queued for the socket before the session counts as too slow.
    pub outbound_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(60)),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            max_line_bytes: config.max_line_bytes,
            outbound_capacity: config.outbound_queue_lines,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingName,
    Active { name: String },
    Closed,
}

/// Why a session ended. Logged, never propagated past the session task.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("client sent exit")]
    Exit,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),
    #[error("server shutting down")]
    Shutdown,
    #[error("client too slow to keep up")]
    Evicted,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),
    #[error("handshake timed out")]
    HandshakeTimeout,
}

pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    state: SessionState,
    broadcaster: SharedBroadcaster,
    events: MembershipEvents,
    settings: SessionSettings,
    eviction: Arc<Eviction>,
    outbound: Option<mpsc::Sender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        broadcaster: SharedBroadcaster,
        events: MembershipEvents,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id,
            peer_addr,
            state: SessionState::AwaitingName,
            broadcaster,
            events,
            settings,
            eviction: Arc::new(Eviction::default()),
            outbound: None,
            writer: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the session protocol to completion on `stream`.
    ///
    /// Returns once the session is closed, deregistered, and its transport
    /// released. A message on `shutdown` (or the sender going away) ends the
    /// session at the next await point.
    pub async fn run<S>(mut self, stream: S, mut shutdown: broadcast::Receiver<()>) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(self.settings.outbound_capacity.max(1));
        self.outbound = Some(tx);
        self.writer = Some(tokio::spawn(write_loop(self.id, write_half, rx)));

        let mut reader = BufReader::new(read_half);
        let reason = match self.handshake(&mut reader, &mut shutdown).await {
            Ok(()) => self.receive_loop(&mut reader, &mut shutdown).await,
            Err(reason) => reason,
        };
        self.close(&reason).await;
        reason
    }

    async fn handshake<R>(
        &mut self,
        reader: &mut R,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), CloseReason>
    where
        R: AsyncBufRead + Unpin,
    {
        self.send(wire::NAME_REQUEST);

        let read = wire::read_line(reader, self.settings.max_line_bytes);
        let outcome = tokio::select! {
            _ = shutdown.recv() => return Err(CloseReason::Shutdown),
            outcome = with_deadline(self.settings.handshake_timeout, read) => outcome,
        };

        let line = match outcome {
            Err(_) => {
                self.send(&wire::error(HANDSHAKE_TIMED_OUT));
                return Err(CloseReason::HandshakeTimeout);
            }
            Ok(Err(e)) => return Err(CloseReason::Transport(e)),
            Ok(Ok(line)) => line.unwrap_or_default(),
        };

        let name = line.trim();
        if name.is_empty() {
            self.send(&wire::error(INVALID_NAME));
            return Err(CloseReason::HandshakeRejected(INVALID_NAME));
        }
        let name = name.to_string();

        self.send(&wire::success(&format!("Connected to chat server as {name}")));
        if let Some(outbound) = &self.outbound {
            self.broadcaster.register(SessionHandle::new(
                self.id,
                name.clone(),
                self.peer_addr,
                outbound.clone(),
                self.eviction.clone(),
            ));
        }
        self.broadcaster.broadcast(&join_notice(&name), Some(self.id));
        self.events.publish(MembershipEvent::Joined {
            id: self.id,
            name: name.clone(),
            peer_addr: self.peer_addr,
        });

        tracing::info!(
            session = %self.id,
            peer = %self.peer_addr,
            name = %name,
            count = self.broadcaster.count(),
            "user joined the chat"
        );
        self.state = SessionState::Active { name };
        Ok(())
    }

    async fn receive_loop<R>(
        &mut self,
        reader: &mut R,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> CloseReason
    where
        R: AsyncBufRead + Unpin,
    {
        let eviction = self.eviction.clone();
        loop {
            let read = tokio::select! {
                _ = shutdown.recv() => return CloseReason::Shutdown,
                _ = eviction.fired() => return CloseReason::Evicted,
                read = wire::read_line(reader, self.settings.max_line_bytes) => read,
            };
            match read {
                Ok(None) => return CloseReason::PeerClosed,
                Err(e) => return CloseReason::Transport(e),
                Ok(Some(line)) if wire::is_exit(&line) => return CloseReason::Exit,
                Ok(Some(line)) => self.relay(&line),
            }
        }
    }

    /// Echo a line back to its sender and broadcast it to everyone else.
    fn relay(&self, line: &str) {
        let SessionState::Active { name } = &self.state else {
            return;
        };
        match Message::new(name, line) {
            Ok(message) => {
                let formatted = message.format_line();
                tracing::trace!(session = %self.id, line = %formatted, "relaying");
                self.send(&formatted);
                let delivered = self.broadcaster.broadcast(&formatted, Some(self.id));
                tracing::debug!(session = %self.id, delivered, "message broadcast");
            }
            Err(e) => self.send(&wire::error(&e.to_string())),
        }
    }

    /// Move to `Closed`. Safe to call more than once; only the first call
    /// deregisters and announces the departure.
    async fn close(&mut self, reason: &CloseReason) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        match previous {
            SessionState::Closed => return,
            SessionState::Active { name } => {
                if self.broadcaster.remove(self.id).is_some() {
                    self.broadcaster.system_broadcast(&leave_notice(&name));
                    let remaining = self.broadcaster.count();
                    match reason {
                        CloseReason::Evicted => tracing::warn!(
                            session = %self.id,
                            name = %name,
                            remaining,
                            "user dropped for falling behind"
                        ),
                        CloseReason::Transport(e) => tracing::warn!(
                            session = %self.id,
                            name = %name,
                            error = %e,
                            remaining,
                            "user disconnected abruptly"
                        ),
                        _ => tracing::info!(
                            session = %self.id,
                            name = %name,
                            %reason,
                            remaining,
                            "user left the chat"
                        ),
                    }
                    self.events.publish(MembershipEvent::Left {
                        id: self.id,
                        name,
                        reason: LeaveReason::from(reason),
                    });
                }
            }
            SessionState::AwaitingName => {
                tracing::debug!(
                    session = %self.id,
                    peer = %self.peer_addr,
                    %reason,
                    "connection closed before handshake completed"
                );
            }
        }

        // The writer exits once every sender is gone: ours here, the
        // registry's copy in `remove` above.
        self.outbound = None;
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
                tracing::debug!(session = %self.id, "writer did not drain in time, aborting");
                writer.abort();
            }
        }
    }

    fn send(&self, line: &str) {
        let Some(tx) = &self.outbound else {
            return;
        };
        match tx.try_send(line.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.eviction.fire() {
                    tracing::warn!(session = %self.id, "outbound queue full, dropping slow client");
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(session = %self.id, "outbound queue closed, dropping line");
            }
        }
    }
}

async fn with_deadline<F: Future>(
    deadline: Option<Duration>,
    fut: F,
) -> Result<F::Output, Elapsed> {
    match deadline {
        Some(d) => tokio::time::timeout(d, fut).await,
        None => Ok(fut.await),
    }
}

/// Drain the outbound queue into the socket. On a write error the queue is
/// closed so later sends fail fast instead of piling up.
async fn write_loop<W>(id: SessionId, mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        if let Err(e) = wire::write_line(&mut writer, &line).await {
            tracing::debug!(session = %id, error = %e, "write failed, closing outbound queue");
            rx.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
}
