//! Client session — one caller-driven sending side, one background task
//! reading broadcast lines.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use parley_core::config::ClientConfig;
use parley_core::message::is_valid_body;
use parley_core::wire::{self, Reply, DEFAULT_MAX_LINE_BYTES};

use crate::error::{ConnectError, SendError};

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bounds the TCP connect and each handshake read.
    pub connect_timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl From<&ClientConfig> for ConnectOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called or the client was dropped.
    Local,
    /// The server closed the stream.
    ServerClosed,
    /// A read or write failed.
    Transport(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => f.write_str("disconnected from server"),
            DisconnectReason::ServerClosed => f.write_str("the server has disconnected"),
            DisconnectReason::Transport(e) => write!(f, "connection to server lost: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Line(String),
    Disconnected(DisconnectReason),
}

/// Presentation boundary for received lines.
///
/// `on_disconnect` is called exactly once per connected client.
pub trait EventSink: Send + Sync + 'static {
    fn on_line(&self, line: String);
    fn on_disconnect(&self, reason: DisconnectReason);
}

impl EventSink for mpsc::UnboundedSender<ClientEvent> {
    fn on_line(&self, line: String) {
        let _ = self.send(ClientEvent::Line(line));
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        let _ = self.send(ClientEvent::Disconnected(reason));
    }
}

struct Shared {
    connected: AtomicBool,
    notified: AtomicBool,
    writer: Mutex<Option<OwnedWriteHalf>>,
    stop: watch::Sender<bool>,
    sink: Box<dyn EventSink>,
}

impl Shared {
    fn notify_disconnect(&self, reason: DisconnectReason) {
        if !self.notified.swap(true, Ordering::SeqCst) {
            self.sink.on_disconnect(reason);
        }
    }

    /// Mark disconnected, stop the receiver, and close the write side.
    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stop.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

pub struct ChatClient {
    display_name: String,
    server_addr: SocketAddr,
    welcome: String,
    shared: Arc<Shared>,
    receiver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Open a connection to `host:port`, complete the handshake as
    /// `display_name`, and start the receive task.
    ///
    /// On any failure nothing is left running.
    pub async fn connect<E: EventSink>(
        host: &str,
        port: u16,
        display_name: &str,
        options: ConnectOptions,
        sink: E,
    ) -> Result<Self, ConnectError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(ConnectError::InvalidName);
        }

        let (stream, server_addr) = open(host, port, options.connect_timeout).await?;
        tracing::debug!(server = %server_addr, "connected, starting handshake");

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let first = read_reply(&mut reader, server_addr, &options).await?;
        if first != wire::NAME_REQUEST {
            return Err(ConnectError::UnexpectedResponse(first));
        }
        wire::write_line(&mut write_half, display_name).await?;

        let welcome = match Reply::parse(&read_reply(&mut reader, server_addr, &options).await?) {
            Reply::Success(text) => text,
            Reply::Error(reason) => return Err(ConnectError::Rejected(reason)),
            Reply::Other(line) => return Err(ConnectError::UnexpectedResponse(line)),
        };
        tracing::info!(server = %server_addr, name = display_name, "joined chat");

        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            notified: AtomicBool::new(false),
            writer: Mutex::new(Some(write_half)),
            stop,
            sink: Box::new(sink),
        });
        let receiver = tokio::spawn(receive_loop(
            shared.clone(),
            reader,
            stop_rx,
            options.max_line_bytes,
        ));

        Ok(Self {
            display_name: display_name.to_string(),
            server_addr,
            welcome,
            shared,
            receiver: std::sync::Mutex::new(Some(receiver)),
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Text of the server's handshake acknowledgment.
    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Send one line to the server. A write failure disconnects the client
    /// exactly as a server-side disconnect would.
    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        if !is_valid_body(text) {
            return Err(SendError::EmptyMessage);
        }

        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SendError::NotConnected);
        };
        if let Err(e) = wire::write_line(writer, text).await {
            guard.take();
            drop(guard);
            tracing::warn!(error = %e, "send failed, treating as disconnect");
            self.shared.teardown().await;
            self.shared
                .notify_disconnect(DisconnectReason::Transport(e.to_string()));
            return Err(SendError::Transport(e));
        }
        Ok(())
    }

    /// Stop receiving and close the connection. Idempotent, and safe after
    /// the server has already gone away.
    pub async fn disconnect(&self) {
        self.shared.teardown().await;
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
        self.shared.notify_disconnect(DisconnectReason::Local);
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.stop.send_replace(true);
    }
}

async fn open(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr), ConnectError> {
    let unresolvable = || ConnectError::UnresolvableAddress {
        host: host.to_string(),
    };
    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            tracing::debug!(host, error = %e, "address lookup failed");
            return Err(unresolvable());
        }
    };

    let mut last_err = None;
    for addr in addrs {
        let err = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok((stream, addr)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                ConnectError::ConnectionRefused { addr }
            }
            Ok(Err(e)) => ConnectError::Io(e),
            Err(_) => ConnectError::ConnectTimeout {
                addr,
                after: connect_timeout,
            },
        };
        tracing::debug!(%addr, error = %err, "connect attempt failed");
        last_err = Some(err);
    }
    Err(last_err.unwrap_or_else(unresolvable))
}

async fn read_reply(
    reader: &mut BufReader<OwnedReadHalf>,
    addr: SocketAddr,
    options: &ConnectOptions,
) -> Result<String, ConnectError> {
    let read = wire::read_line(reader, options.max_line_bytes);
    match tokio::time::timeout(options.connect_timeout, read).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => Err(ConnectError::ServerClosed),
        Ok(Err(e)) => Err(ConnectError::Io(e)),
        Err(_) => Err(ConnectError::ConnectTimeout {
            addr,
            after: options.connect_timeout,
        }),
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: BufReader<OwnedReadHalf>,
    mut stop: watch::Receiver<bool>,
    max_line_bytes: usize,
) {
    let reason = loop {
        if *stop.borrow() {
            break DisconnectReason::Local;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break DisconnectReason::Local;
                }
            }
            read = wire::read_line(&mut reader, max_line_bytes) => match read {
                Ok(Some(line)) => shared.sink.on_line(line),
                Ok(None) => break DisconnectReason::ServerClosed,
                Err(e) => break DisconnectReason::Transport(e.to_string()),
            },
        }
    };

    if reason != DisconnectReason::Local {
        tracing::warn!(%reason, "connection to server lost");
    }
    shared.teardown().await;
    shared.notify_disconnect(reason);
}
