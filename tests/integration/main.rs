//! Parley integration test harness.
//!
//! Every test starts its own in-process server on 127.0.0.1:0 and talks to
//! it over real loopback TCP, so tests run in parallel without root or
//! fixed ports. Each test is responsible for stopping what it starts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_client::{ChatClient, ClientEvent, ConnectOptions, DisconnectReason};
use parley_server::{
    Broadcaster, Dispatcher, DispatcherSettings, MembershipEvent, Registry, ServerError,
    ShutdownHandle,
};

mod failures;
mod scenarios;

/// How long any single expectation may wait.
pub const WAIT: Duration = Duration::from_secs(3);

// ── Server ────────────────────────────────────────────────────────────────────

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<Registry>,
    pub membership: tokio::sync::broadcast::Receiver<MembershipEvent>,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(DispatcherSettings::default()).await
    }

    pub async fn start_with(settings: DispatcherSettings) -> Result<Self> {
        let registry = Registry::shared();
        let dispatcher = Dispatcher::bind("127.0.0.1:0".parse()?, registry.clone(), settings)
            .await
            .context("failed to bind test server")?;
        let addr = dispatcher.local_addr();
        let shutdown = dispatcher.shutdown_handle();
        let membership = dispatcher.subscribe();
        let task = tokio::spawn(dispatcher.run());
        Ok(Self {
            addr,
            registry,
            membership,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn next_membership(&mut self) -> Result<MembershipEvent> {
        Ok(tokio::time::timeout(WAIT, self.membership.recv())
            .await
            .context("timed out waiting for a membership event")??)
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .context("server did not shut down")??
            .context("server returned an error")
    }
}

/// Poll until the registry holds `expected` sessions.
pub async fn wait_for_count(registry: &Registry, expected: usize) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if registry.count() == expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!(
        "expected {expected} sessions, registry holds {}",
        registry.count()
    )
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct TestClient {
    pub client: ChatClient,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl TestClient {
    pub async fn join(server: &TestServer, name: &str) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let client = ChatClient::connect(
            "127.0.0.1",
            server.port(),
            name,
            ConnectOptions::default(),
            tx,
        )
        .await
        .with_context(|| format!("{name} failed to connect"))?;
        Ok(Self { client, events })
    }

    pub async fn next_event(&mut self) -> Result<ClientEvent> {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .context("timed out waiting for an event")?
            .context("event channel closed")
    }

    pub async fn next_line(&mut self) -> Result<String> {
        match self.next_event().await? {
            ClientEvent::Line(line) => Ok(line),
            ClientEvent::Disconnected(reason) => bail!("disconnected: {reason}"),
        }
    }

    /// Read lines until one contains every needle.
    pub async fn line_containing(&mut self, needles: &[&str]) -> Result<String> {
        loop {
            let line = self.next_line().await?;
            if needles.iter().all(|n| line.contains(n)) {
                return Ok(line);
            }
        }
    }

    pub async fn disconnected(&mut self) -> Result<DisconnectReason> {
        loop {
            if let ClientEvent::Disconnected(reason) = self.next_event().await? {
                return Ok(reason);
            }
        }
    }

    /// Nothing further has arrived.
    pub async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
        if let Ok(event) = self.events.try_recv() {
            panic!("expected no further events, got {event:?}");
        }
    }

    pub async fn say(&self, text: &str) -> Result<()> {
        self.client.send(text).await.context("send failed")
    }
}

// ── Raw protocol peer ─────────────────────────────────────────────────────────

/// A bare TCP peer for exercising the wire protocol without the client
/// library's validation.
pub struct RawPeer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    pub async fn connect(server: &TestServer) -> Result<Self> {
        let stream = TcpStream::connect(server.addr).await?;
        let (r, w) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(r).lines(),
            writer: w,
        })
    }

    pub async fn line(&mut self) -> Result<Option<String>> {
        Ok(tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .context("timed out waiting for a line")??)
    }

    pub async fn say(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }
}
