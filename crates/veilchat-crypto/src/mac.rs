//! HMAC-SHA256 keyed integrity tags.
//!
//! Backs the outer envelope tag: a keyed check over the serialized
//! encrypted envelope, verified **before** any AEAD decryption is
//! attempted. Verification is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use veilchat_types::{Result, VeilchatError};

/// HMAC-SHA256 type alias.
type HmacSha256 = Hmac<Sha256>;

/// Fixed output length of HMAC-SHA256 in bytes.
pub const HMAC_LEN: usize = 32;

/// Computes HMAC-SHA256 over `data` using `key`.
///
/// # Errors
///
/// Returns [`VeilchatError::CryptoError`] if HMAC initialisation fails
/// (should not happen with SHA-256, but we avoid `unwrap`).
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| VeilchatError::CryptoError {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    mac.update(data);
    let result = mac.finalize().into_bytes();

    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    Ok(output)
}

/// Verifies an HMAC-SHA256 tag in constant time.
///
/// # Errors
///
/// Returns [`VeilchatError::IntegrityFailure`] if the computed tag does
/// not match `expected`, or [`VeilchatError::CryptoError`] if HMAC
/// initialisation fails.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| VeilchatError::CryptoError {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    mac.update(data);

    mac.verify_slice(expected)
        .map_err(|_| VeilchatError::IntegrityFailure {
            reason: "HMAC-SHA256 tag mismatch".into(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
