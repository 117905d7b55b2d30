//! Veilchat relay server library.
//!
//! The relay authenticates users and forwards opaque envelopes between
//! them. It never holds chat session keys and never sees peer-to-peer
//! plaintext — its one secret per connection is the transport session
//! key used for the authentication phase and server notices.
//!
//! - [`users`] — on-disk salted-verifier store.
//! - [`auth`] — verifier checks and sliding-window login throttling.
//! - [`router`] — the identity → connection table.
//! - [`handler`] — the per-connection protocol task.
//! - [`server`] — listener setup and accept loop.

pub mod auth;
pub mod config;
pub mod handler;
pub mod router;
pub mod server;
pub mod users;
