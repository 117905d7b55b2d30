//! Session-key derivation from Diffie-Hellman shared secrets.
//!
//! A [`SessionKey`] is derived by running the shared secret's canonical
//! decimal representation through PBKDF2-HMAC-SHA256 with a salt fixed
//! by the [`KeyContext`]. The salts differ per context, so a transport
//! key derived with the relay and a chat key derived with a peer are
//! unrelated even if the underlying numeric secrets collided.
//!
//! # Derivation parameters
//!
//! - **Input**: decimal string of the shared secret.
//! - **Salt**: `b"prelogin"` or `b"chat"` per [`KeyContext`].
//! - **Iterations**: 100 000 (protocol default).
//! - **Output**: 32 bytes (one AES-256-GCM key).

use zeroize::{Zeroize, ZeroizeOnDrop};

use veilchat_crypto::dh::SharedSecret;
use veilchat_crypto::kdf::{pbkdf2_derive_key, KdfParams};
use veilchat_types::{KeyContext, Result};

// ---------------------------------------------------------------------------
// SessionKey
// ---------------------------------------------------------------------------

/// Symmetric session key bound to one peer and one [`KeyContext`].
///
/// Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

// SessionKey does not implement Clone/Debug to prevent leakage.

impl SessionKey {
    /// Fixed byte length of a session key.
    pub const LEN: usize = 32;

    /// Wraps raw key material. Exists for the codec boundary and tests;
    /// protocol code derives keys via [`derive_session_key`].
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw 32-byte key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derives the 32-byte session key for `context` from a completed
/// exchange.
///
/// Deterministic: both sides of the exchange hold the identical secret
/// and derive the identical key.
pub fn derive_session_key(secret: &SharedSecret, context: KeyContext) -> Result<SessionKey> {
    let derived = pbkdf2_derive_key(
        &secret.canonical_bytes(),
        context.salt(),
        &KdfParams::default(),
    )?;
    Ok(SessionKey(derived.to_bytes()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
