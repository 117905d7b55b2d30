//! Cryptographic primitives for the Veilchat relay messenger.
//!
//! Four concerns, one module each:
//!
//! - [`dh`] — ephemeral finite-field Diffie-Hellman over a fixed
//!   3072-bit MODP group.
//! - [`kdf`] — PBKDF2-HMAC-SHA256 key derivation, used both for session
//!   keys and password verifiers.
//! - [`aead`] — AES-256-GCM authenticated encryption with 96-bit nonces.
//! - [`mac`] — HMAC-SHA256 keyed integrity tags.
//!
//! Higher-level protocol constructions (envelope sealing, session-key
//! contexts) live in `veilchat-protocol`; this crate stays at the
//! primitive level.

pub mod aead;
pub mod dh;
pub mod kdf;
pub mod mac;
