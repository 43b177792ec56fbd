//! Accept loop — owns the listening socket and spawns one task per
//! connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use parley_core::config::ServerConfig;
use parley_core::message::system_line;

use crate::error::ServerError;
use crate::events::{MembershipEvent, MembershipEvents};
use crate::registry::{SessionId, SharedBroadcaster};
use crate::session::{Session, SessionSettings};

/// Pause after descriptor exhaustion so the loop doesn't spin on EMFILE.
const FD_EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

const SHUTDOWN_NOTICE: &str = "Server is shutting down.";

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub session: SessionSettings,
    pub shutdown_grace: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl From<&ServerConfig> for DispatcherSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            session: SessionSettings::from(config),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// Requests a running dispatcher to stop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }
}

pub struct Dispatcher {
    listener: TcpListener,
    local_addr: SocketAddr,
    broadcaster: SharedBroadcaster,
    events: MembershipEvents,
    settings: DispatcherSettings,
    stop: broadcast::Sender<()>,
    // Subscribed at bind time so a shutdown requested before `run` is
    // polled is not lost.
    stop_rx: broadcast::Receiver<()>,
}

impl Dispatcher {
    /// Bind the listening socket. Fails with [`ServerError::Bind`] and leaves
    /// nothing behind if the address is taken or not permitted.
    pub async fn bind(
        addr: SocketAddr,
        broadcaster: SharedBroadcaster,
        settings: DispatcherSettings,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        let (stop, stop_rx) = broadcast::channel(1);

        tracing::info!(addr = %local_addr, "chat server listening");
        Ok(Self {
            listener,
            local_addr,
            broadcaster,
            events: MembershipEvents::new(),
            settings,
            stop,
            stop_rx,
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.stop.clone())
    }

    /// Feed of joins and departures. Subscribe before calling `run`.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Accept connections until shutdown is requested or the listening
    /// socket fails. Either way every session is told to terminate and
    /// given `shutdown_grace` to finish before being aborted.
    pub async fn run(self) -> Result<(), ServerError> {
        let Dispatcher {
            listener,
            local_addr,
            broadcaster,
            events,
            settings,
            stop: _stop,
            mut stop_rx,
        } = self;

        let (sessions_shutdown, _) = broadcast::channel::<()>(1);
        let mut sessions = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::info!("shutdown requested, no longer accepting connections");
                    break Ok(());
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "session task panicked");
                        }
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                        }
                        let id = SessionId::next();
                        let session = Session::new(
                            id,
                            peer_addr,
                            broadcaster.clone(),
                            events.clone(),
                            settings.session.clone(),
                        );
                        let shutdown = sessions_shutdown.subscribe();
                        sessions.spawn(async move {
                            session.run(stream, shutdown).await;
                        });
                        tracing::info!(session = %id, peer = %peer_addr, "new client connected");
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        tracing::warn!(error = %e, "error accepting client connection");
                        if is_fd_exhaustion(&e) {
                            tokio::time::sleep(FD_EXHAUSTION_BACKOFF).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!(addr = %local_addr, error = %e, "listening socket failed");
                        break Err(ServerError::Listener(e));
                    }
                },
            }
        };

        drop(listener);
        broadcaster.system_broadcast(&system_line(SHUTDOWN_NOTICE));
        let _ = sessions_shutdown.send(());

        let drained = tokio::time::timeout(settings.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = sessions.len(), "sessions did not close in time, aborting");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        tracing::info!(addr = %local_addr, "server shut down");
        result
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_fd_exhaustion(e)
}

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
