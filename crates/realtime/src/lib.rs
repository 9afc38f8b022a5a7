//! PaCo Realtime
//!
//! The resilient realtime channel between the chat client and the backend:
//! a `Transport` seam over WebSockets and the `ConnectionManager` that keeps
//! it open.

pub mod connection;
pub mod transport;

pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionListener, ConnectionManager, ConnectionState,
};
pub use transport::{Transport, TransportError, WebSocketTransport};
