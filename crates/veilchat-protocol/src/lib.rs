//! Protocol layer of the Veilchat relay messenger.
//!
//! Sits between the crypto primitives (`veilchat-crypto`) and the two
//! endpoints (`veilchat-server`, `veilchat-client`):
//!
//! - [`wire`] — the logical frame schema exchanged over the relay.
//! - [`codec`] — sealing and opening of encrypted envelopes (AEAD plus
//!   an outer keyed integrity tag).
//! - [`session`] — session-key derivation with context domain
//!   separation.
//! - [`state`] — the per-connection protocol state machine.
//! - [`transport`] — newline-delimited JSON framing over async streams.

pub mod codec;
pub mod session;
pub mod state;
pub mod transport;
pub mod wire;
