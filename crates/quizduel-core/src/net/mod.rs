//! Network layer for the duel server
//!
//! ## Protocol
//!
//! JSON text frames over a WebSocket:
//! 1. Connect with a bearer token
//! 2. Join the duel room (or the quick match queue)
//! 3. Receive broadcast duel events and send answers
//!
//! Messages are decoded once in [`protocol`] into closed sum types.

mod connection;
pub mod protocol;
mod transport;

pub use connection::{ConnectionState, RetryDecision, RetryPolicy};
pub use protocol::{ClientMessage, DuelId, EventKind, ServerMessage, UserId};
pub use transport::{Connector, Transport, WebSocketConnector, WebSocketTransport};
