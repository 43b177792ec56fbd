use std::io;
use std::net::SocketAddr;

/// Errors that end the server. Per-connection failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{}", bind_message(.addr, .source))]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listening socket failed: {0}")]
    Listener(#[source] io::Error),
    #[error("could not read local address of listening socket: {0}")]
    LocalAddr(#[source] io::Error),
}

fn bind_message(addr: &SocketAddr, source: &io::Error) -> String {
    let port = addr.port();
    match source.kind() {
        io::ErrorKind::AddrInUse => format!(
            "port {port} is already in use; close the application using it, \
             choose a different port, or wait a few moments and try again"
        ),
        io::ErrorKind::PermissionDenied => format!(
            "no permission to listen on port {port}; choose a port between 1024 and 65535"
        ),
        io::ErrorKind::AddrNotAvailable => format!(
            "address {} is not available on this host; check the bind address",
            addr.ip()
        ),
        _ => format!("could not start server on {addr}: {source}"),
    }
}

impl ServerError {
    /// True for the port-already-taken case.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ServerError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}
