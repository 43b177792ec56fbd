use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Why a connection attempt failed. Each variant reads as advice to the user.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("username cannot be empty")]
    InvalidName,
    #[error("could not find server '{host}'; check the address and try again")]
    UnresolvableAddress { host: String },
    #[error(
        "could not connect to {addr}: connection refused; check that the server is running, \
         the address and port are right, and no firewall is blocking the connection"
    )]
    ConnectionRefused { addr: SocketAddr },
    #[error("no response from {addr} after {}s; check the address and your network", .after.as_secs())]
    ConnectTimeout { addr: SocketAddr, after: Duration },
    #[error("server rejected connection: {0}")]
    Rejected(String),
    #[error("unexpected server response '{0}'; is this a chat server?")]
    UnexpectedResponse(String),
    #[error("server closed the connection during the handshake")]
    ServerClosed,
    #[error("connection failed: {0}; check your network connection")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected to server")]
    NotConnected,
    #[error("cannot send empty message")]
    EmptyMessage,
    #[error("failed to send message: {0}")]
    Transport(#[source] io::Error),
}
