//! Veilchat client library.
//!
//! Everything the interactive binary needs to speak the relay
//! protocol:
//!
//! - [`session`] — the per-peer session-key cache and in-flight
//!   key-exchange bookkeeping.
//! - [`connection`] — transport handshake, login, the background
//!   receive loop, and the [`connection::Client`] command surface.
//!
//! The binary in `main.rs` adds the REPL on top; tests drive the
//! library API directly.

pub mod connection;
pub mod session;
