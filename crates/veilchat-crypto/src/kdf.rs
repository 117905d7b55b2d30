//! PBKDF2-HMAC-SHA256 key derivation.
//!
//! One KDF serves two purposes in the protocol:
//!
//! - Deriving 32-byte session keys from Diffie-Hellman shared secrets
//!   (a password-KDF is unnecessarily expensive for high-entropy input,
//!   but the deployed protocol derives this way and interoperability
//!   wins).
//! - Deriving password verifiers for the user store.
//!
//! Both use the full 100 000-iteration default; tests use lighter
//! parameters.

use hmac::Hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use veilchat_types::{Result, VeilchatError};

// ---------------------------------------------------------------------------
// KdfParams
// ---------------------------------------------------------------------------

/// Tuning parameters for PBKDF2.
#[derive(Clone, Copy, Debug)]
pub struct KdfParams {
    /// Iteration count. Must be ≥ 1; the protocol default is 100 000.
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

// ---------------------------------------------------------------------------
// DerivedKey
// ---------------------------------------------------------------------------

/// 256-bit key derived by PBKDF2.
///
/// Automatically zeroized when dropped to minimize the time sensitive
/// material resides in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
    /// Fixed byte length of the derived key.
    pub const LEN: usize = 32;

    /// Returns the raw 32-byte key material.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Copies the key material out. Callers own the zeroization of the
    /// returned array.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

// DerivedKey does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derives a 256-bit key from a secret and salt using PBKDF2-HMAC-SHA256.
///
/// # Errors
///
/// - [`VeilchatError::ConfigError`] if `iterations` is 0 or the salt is
///   empty.
/// - [`VeilchatError::CryptoError`] if the underlying PBKDF2 computation
///   fails.
pub fn pbkdf2_derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<DerivedKey> {
    if params.iterations == 0 {
        return Err(VeilchatError::ConfigError {
            reason: "PBKDF2 iteration count must be at least 1".into(),
        });
    }
    if salt.is_empty() {
        return Err(VeilchatError::ConfigError {
            reason: "PBKDF2 salt must not be empty".into(),
        });
    }

    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt, params.iterations, &mut output).map_err(|e| {
        VeilchatError::CryptoError {
            reason: format!("PBKDF2 derivation failed: {e}"),
        }
    })?;

    Ok(DerivedKey(output))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
