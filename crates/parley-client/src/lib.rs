//! parley-client — client side of the Parley chat protocol.
//!
//! [`ChatClient::connect`] performs the handshake and starts a background
//! receive task that surfaces every server line to an [`EventSink`]. The
//! caller keeps the sending side.

mod client;
mod error;

pub use client::{ChatClient, ClientEvent, ConnectOptions, DisconnectReason, EventSink};
pub use error::{ConnectError, SendError};
