//! Encrypted envelope construction and verification.
//!
//! Every confidential payload travels as a [`SealedPayload`]: an
//! AES-256-GCM [`EncryptedEnvelope`] plus an **outer** HMAC-SHA256 tag
//! computed over the serialized envelope under the same session key.
//!
//! The outer tag is deliberately redundant with the GCM tag for the
//! ciphertext itself; what it adds is coverage of the serialized
//! envelope as a whole, including the `iv` field the AEAD does not
//! authenticate as associated data. [`open`] verifies the outer tag
//! first, in constant time, and refuses to even attempt decryption when
//! it fails — tampering (e.g. nonce substitution) is rejected before
//! any cipher work.

use serde::{Deserialize, Serialize};

use veilchat_crypto::aead::{decrypt_aes256_gcm, encrypt_aes256_gcm, generate_nonce, GcmNonce};
use veilchat_crypto::mac::{hmac_sha256, verify_hmac_sha256};
use veilchat_types::{Result, VeilchatError};

use crate::session::SessionKey;

// ---------------------------------------------------------------------------
// EncryptedEnvelope
// ---------------------------------------------------------------------------

/// Output of one AEAD operation, transport-encoded as base64 fields.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// 12-byte GCM nonce.
    #[serde(with = "b64_arr")]
    pub iv: [u8; 12],
    /// Ciphertext, same length as the plaintext.
    #[serde(with = "b64_vec")]
    pub ciphertext: Vec<u8>,
    /// Detached 16-byte GCM authentication tag.
    #[serde(with = "b64_arr")]
    pub tag: [u8; 16],
}

impl EncryptedEnvelope {
    /// Canonical serialized form the outer tag is computed over.
    ///
    /// Field order is fixed by the struct definition, so sealer and
    /// verifier always serialize identical bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| VeilchatError::CryptoError {
            reason: format!("envelope serialization failed: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// SealedPayload
// ---------------------------------------------------------------------------

/// An encrypted envelope together with its outer integrity tag (hex).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// The AEAD envelope.
    pub enc: EncryptedEnvelope,
    /// Hex HMAC-SHA256 over [`EncryptedEnvelope::canonical_bytes`].
    pub hmac: String,
}

// ---------------------------------------------------------------------------
// Seal / Open
// ---------------------------------------------------------------------------

/// Seals a plaintext under a session key.
///
/// Generates a fresh random nonce, encrypts with AES-256-GCM, then
/// computes the outer tag over the serialized envelope.
pub fn seal(plaintext: &[u8], key: &SessionKey) -> Result<SealedPayload> {
    let nonce = generate_nonce();
    let encrypted = encrypt_aes256_gcm(key.as_bytes(), &nonce, plaintext)?;

    let enc = EncryptedEnvelope {
        iv: *nonce.as_bytes(),
        ciphertext: encrypted.ciphertext,
        tag: encrypted.tag,
    };

    let outer = hmac_sha256(key.as_bytes(), &enc.canonical_bytes()?)?;
    Ok(SealedPayload {
        enc,
        hmac: hex::encode(outer),
    })
}

/// Opens a sealed payload.
///
/// Verification order is fixed: the outer tag is checked first (constant
/// time), and only then is AEAD decryption attempted. Either failure
/// yields [`VeilchatError::IntegrityFailure`] with no plaintext released.
pub fn open(sealed: &SealedPayload, key: &SessionKey) -> Result<Vec<u8>> {
    let expected = hex::decode(&sealed.hmac).map_err(|_| VeilchatError::IntegrityFailure {
        reason: "outer tag is not valid hex".into(),
    })?;

    verify_hmac_sha256(key.as_bytes(), &sealed.enc.canonical_bytes()?, &expected)?;

    decrypt_aes256_gcm(
        key.as_bytes(),
        &GcmNonce::from_bytes(sealed.enc.iv),
        &sealed.enc.ciphertext,
        &sealed.enc.tag,
    )
}

/// Opens a sealed payload and interprets the plaintext as UTF-8.
pub fn open_text(sealed: &SealedPayload, key: &SessionKey) -> Result<String> {
    let bytes = open(sealed, key)?;
    String::from_utf8(bytes).map_err(|_| VeilchatError::ProtocolViolation {
        reason: "sealed payload is not valid UTF-8".into(),
    })
}

// ---------------------------------------------------------------------------
// base64 field encoding
// ---------------------------------------------------------------------------

mod b64_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(|_| de::Error::custom("invalid base64"))
    }
}

mod b64_arr {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        de: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(de)?;
        let decoded = STANDARD
            .decode(s.as_bytes())
            .map_err(|_| de::Error::custom("invalid base64"))?;
        decoded
            .try_into()
            .map_err(|_| de::Error::custom("unexpected field length"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SessionKey {
        SessionKey::from_bytes([0x42u8; 32])
    }

    #[test]
    fn seal_open_roundtrip() -> Result<()> {
        let key = test_key();
        let sealed = seal(b"hello", &key)?;
        let opened = open(&sealed, &key)?;
        assert_eq!(opened, b"hello");
        Ok(())
    }

    #[test]
    fn open_text_roundtrip() -> Result<()> {
        let key = test_key();
        let sealed = seal("grüße".as_bytes(), &key)?;
        assert_eq!(open_text(&sealed, &key)?, "grüße");
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> Result<()> {
        let sealed = seal(b"secret", &test_key())?;
        let other = SessionKey::from_bytes([0x43u8; 32]);
        assert!(open(&sealed, &other).is_err());
        Ok(())
    }

    #[test]
    fn tampered_outer_tag_fails() -> Result<()> {
        let key = test_key();
        let mut sealed = seal(b"secret", &key)?;
        // Flip one hex digit.
        let mut chars: Vec<char> = sealed.hmac.chars().collect();
        chars[0] = if chars[0] == '0' { '1' } else { '0' };
        sealed.hmac = chars.into_iter().collect();
        assert!(open(&sealed, &key).is_err());
        Ok(())
    }

    #[test]
    fn tampered_ciphertext_fails() -> Result<()> {
        let key = test_key();
        let mut sealed = seal(b"secret", &key)?;
        sealed.enc.ciphertext[0] ^= 0x01;
        assert!(open(&sealed, &key).is_err());
        Ok(())
    }

    #[test]
    fn tampered_iv_fails() -> Result<()> {
        let key = test_key();
        let mut sealed = seal(b"secret", &key)?;
        sealed.enc.iv[0] ^= 0x01;
        assert!(open(&sealed, &key).is_err());
        Ok(())
    }

    #[test]
    fn tampered_aead_tag_fails() -> Result<()> {
        let key = test_key();
        let mut sealed = seal(b"secret", &key)?;
        sealed.enc.tag[0] ^= 0x01;
        assert!(open(&sealed, &key).is_err());
        Ok(())
    }

    /// Nonce substitution is caught by the outer tag even when the
    /// attacker recomputes nothing — and caught by the AEAD even when
    /// the attacker recomputes the outer tag over the altered envelope.
    #[test]
    fn nonce_substitution_caught_at_both_layers() -> Result<()> {
        let key = test_key();
        let mut sealed = seal(b"secret", &key)?;
        sealed.enc.iv[3] ^= 0xFF;

        // Outer tag now mismatches the altered envelope.
        assert!(open(&sealed, &key).is_err());

        // Recompute the outer tag as a relay-position attacker with the
        // key could not — the AEAD layer still rejects.
        let recomputed = hmac_sha256(key.as_bytes(), &sealed.enc.canonical_bytes()?)?;
        sealed.hmac = hex::encode(recomputed);
        assert!(open(&sealed, &key).is_err());
        Ok(())
    }

    #[test]
    fn non_hex_outer_tag_fails_before_decrypt() -> Result<()> {
        let key = test_key();
        let mut sealed = seal(b"secret", &key)?;
        sealed.hmac = "not hex at all".into();
        assert!(open(&sealed, &key).is_err());
        Ok(())
    }

    #[test]
    fn envelope_serde_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let key = test_key();
        let sealed = seal(b"roundtrip", &key)?;

        let json = serde_json::to_string(&sealed)?;
        let parsed: SealedPayload = serde_json::from_str(&json)?;
        assert_eq!(parsed, sealed);

        let opened = open(&parsed, &key)?;
        assert_eq!(opened, b"roundtrip");
        Ok(())
    }

    #[test]
    fn canonical_bytes_stable_across_deserialization() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let sealed = seal(b"stable", &test_key())?;
        let json = serde_json::to_string(&sealed.enc)?;
        let parsed: EncryptedEnvelope = serde_json::from_str(&json)?;
        assert_eq!(parsed.canonical_bytes()?, sealed.enc.canonical_bytes()?);
        Ok(())
    }
}
