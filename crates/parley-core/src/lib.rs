//! parley-core — wire protocol, message type, and configuration shared by
//! the Parley server and client crates.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{Message, MessageError};
