//! AES-256-GCM authenticated encryption.
//!
//! All symmetric encryption in Veilchat uses AES-256-GCM with 96-bit
//! (12-byte) nonces generated from OS entropy. A nonce **must never be
//! reused** with the same key.
//!
//! The 16-byte GCM tag is carried as a separate field on the wire, so
//! the encrypt path splits it off the ciphertext and the decrypt path
//! joins it back before handing both to the cipher. Verification and
//! decryption are a single atomic operation: a tag mismatch releases no
//! plaintext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use veilchat_types::{Result, VeilchatError};

// ---------------------------------------------------------------------------
// GcmNonce
// ---------------------------------------------------------------------------

/// 96-bit (12-byte) nonce for AES-GCM.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GcmNonce([u8; 12]);

impl GcmNonce {
    /// Fixed byte length of an AES-GCM nonce.
    pub const LEN: usize = 12;

    /// Creates a [`GcmNonce`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying 12-byte array.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Generates a fresh 96-bit random nonce from OS entropy.
pub fn generate_nonce() -> GcmNonce {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    GcmNonce(bytes)
}

// ---------------------------------------------------------------------------
// CiphertextWithTag
// ---------------------------------------------------------------------------

/// Byte length of the GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Ciphertext and detached authentication tag produced by
/// [`encrypt_aes256_gcm`].
#[derive(Clone, Debug)]
pub struct CiphertextWithTag {
    /// Encrypted payload, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Detached 16-byte GCM tag bound to (key, nonce, ciphertext).
    pub tag: [u8; 16],
}

// ---------------------------------------------------------------------------
// Encrypt / Decrypt
// ---------------------------------------------------------------------------

/// Encrypts `plaintext` with AES-256-GCM.
///
/// # Parameters
///
/// - `key` — 256-bit symmetric key.
/// - `nonce` — 96-bit nonce (must be unique per key; use
///   [`generate_nonce`]).
/// - `plaintext` — data to encrypt.
pub fn encrypt_aes256_gcm(
    key: &[u8; 32],
    nonce: &GcmNonce,
    plaintext: &[u8],
) -> Result<CiphertextWithTag> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut combined = cipher
        .encrypt(Nonce::from_slice(&nonce.0), plaintext)
        .map_err(|e| VeilchatError::CryptoError {
            reason: format!("AES-256-GCM encryption failed: {e}"),
        })?;

    // The cipher appends the tag; the wire carries it detached.
    let split_at = combined.len() - TAG_LEN;
    let tag_bytes = combined.split_off(split_at);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&tag_bytes);

    Ok(CiphertextWithTag {
        ciphertext: combined,
        tag,
    })
}

/// Decrypts and verifies AES-256-GCM ciphertext with a detached tag.
///
/// # Errors
///
/// Returns [`VeilchatError::IntegrityFailure`] if tag verification fails
/// (wrong key, wrong nonce, or tampered ciphertext/tag). No partial
/// plaintext is ever released.
pub fn decrypt_aes256_gcm(
    key: &[u8; 32],
    nonce: &GcmNonce,
    ciphertext: &[u8],
    tag: &[u8; 16],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(&nonce.0), combined.as_slice())
        .map_err(|_| VeilchatError::IntegrityFailure {
            reason: "AES-256-GCM tag verification failed".into(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
