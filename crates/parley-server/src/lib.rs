//! parley-server — connection lifecycle and broadcast coordination.
//!
//! The [`Dispatcher`] accepts connections and hands each one to a
//! [`Session`] task. Sessions register with a [`Broadcaster`] once their
//! handshake completes and relay every line they read through it. Joins and
//! departures are also published as [`MembershipEvent`]s.

mod dispatcher;
mod error;
mod events;
mod registry;
mod session;

pub use dispatcher::{Dispatcher, DispatcherSettings, ShutdownHandle};
pub use error::ServerError;
pub use events::{LeaveReason, MembershipEvent, MembershipEvents};
pub use registry::{
    Broadcaster, Delivery, Eviction, Registry, SessionHandle, SessionId, SharedBroadcaster,
};
pub use session::{CloseReason, Session, SessionSettings, SessionState};
