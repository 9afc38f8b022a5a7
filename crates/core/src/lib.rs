//! PaCo Core
//!
//! Transport-independent logic for the PaCo chat client: the wire protocol,
//! the conversational message model, the stream assembler that turns inbound
//! frames into session updates, the conversation session itself, and the
//! voice capture/playback coordinator. Nothing in this crate performs I/O;
//! the realtime and client crates supply sockets, HTTP, and devices through
//! the traits defined here.

pub mod api;
pub mod assembler;
pub mod message;
pub mod protocol;
pub mod session;
pub mod voice;

/// Anything that can put a `ChatRequest` on the wire.
///
/// `send` must not block or queue: it reports whether the request left the
/// client right now. A `false` is a lost message that nobody retries.
#[cfg_attr(test, mockall::automock)]
pub trait Outbound {
    fn send(&self, request: &protocol::ChatRequest) -> bool;
}

/// The bearer credentials the UI hands to the core after sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub research_id: String,
}
