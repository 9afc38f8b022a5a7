//! PaCo Client Library Crate
//!
//! Everything the `paco` terminal client needs beyond the core logic:
//! configuration, the HTTP implementation of the backend API, the sign-in
//! flow, the chat runtime that ties session, connection, and voice together,
//! and terminal stand-ins for audio devices. `bin/client.rs` is a thin
//! wrapper around this library.

pub mod audio;
pub mod config;
pub mod http;
pub mod onboarding;
pub mod runtime;
