//! Ephemeral finite-field Diffie-Hellman key agreement.
//!
//! All exchanges run over the published 3072-bit MODP group from
//! RFC 3526 §5 with generator 2. Keypairs are generated fresh per
//! exchange and discarded once the shared secret is derived.
//!
//! Public values received from the network **must** pass
//! [`validate_public_value`] before any exponentiation: the degenerate
//! values 0, 1 and p-1 collapse the shared secret to a constant, and a
//! value ≥ p is malformed. Group parameters received from a peer (the
//! responder side of a chat exchange) go through [`validate_group`]
//! first.

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;

use veilchat_types::{Result, VeilchatError};

// ---------------------------------------------------------------------------
// Group parameters
// ---------------------------------------------------------------------------

/// Generator of the fixed MODP group.
pub const GENERATOR: u32 = 2;

/// Smallest modulus accepted from a peer, in bits.
pub const MIN_MODULUS_BITS: u64 = 1024;

/// 3072-bit MODP safe prime, RFC 3526 §5.
const MODP_3072_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64\
ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B\
F12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31\
43DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Returns the fixed group modulus.
///
/// The constant is compile-time hex; a corrupted constant would parse to
/// zero, which the `default_group_is_3072_bits` test guards against.
pub fn group_modulus() -> BigUint {
    BigUint::parse_bytes(MODP_3072_HEX.as_bytes(), 16).unwrap_or_default()
}

/// Returns the fixed group generator.
pub fn group_generator() -> BigUint {
    BigUint::from(GENERATOR)
}

// ---------------------------------------------------------------------------
// DhKeyPair
// ---------------------------------------------------------------------------

/// Ephemeral Diffie-Hellman keypair.
///
/// Holds the private exponent alongside the group it was generated in so
/// a pending exchange can later finish against the matching modulus.
pub struct DhKeyPair {
    private: BigUint,
    public: BigUint,
    generator: BigUint,
    modulus: BigUint,
}

// DhKeyPair does not implement Clone/Debug to prevent leakage.

impl DhKeyPair {
    /// Generates a fresh keypair in the fixed 3072-bit group.
    pub fn generate() -> Self {
        Self::generate_in(group_generator(), group_modulus())
    }

    /// Generates a fresh keypair in the given group.
    ///
    /// The caller is responsible for having validated foreign group
    /// parameters via [`validate_group`]. The private exponent is drawn
    /// uniformly from `[0, p)` using the OS CSPRNG.
    pub fn generate_in(generator: BigUint, modulus: BigUint) -> Self {
        let mut rng = OsRng;
        let private = rng.gen_biguint_below(&modulus);
        let public = generator.modpow(&private, &modulus);
        Self {
            private,
            public,
            generator,
            modulus,
        }
    }

    /// Public value to transmit to the peer.
    pub fn public_value(&self) -> &BigUint {
        &self.public
    }

    /// Private exponent. Needed by the pending-exchange table so the
    /// initiator can finish the exchange when the reply arrives.
    pub fn private_exponent(&self) -> &BigUint {
        &self.private
    }

    /// Group generator this keypair was created in.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Group modulus this keypair was created in.
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Computes the shared secret against a peer's public value.
    ///
    /// Validates the public value first; see [`compute_shared_secret`].
    pub fn shared_secret(&self, their_public: &BigUint) -> Result<SharedSecret> {
        compute_shared_secret(their_public, &self.private, &self.modulus)
    }
}

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Result of a completed Diffie-Hellman exchange.
///
/// Never transmitted; consumed immediately by session-key derivation via
/// [`SharedSecret::canonical_bytes`].
pub struct SharedSecret(BigUint);

// SharedSecret does not implement Clone/Debug to prevent leakage.

impl SharedSecret {
    /// Canonical byte representation fed to the KDF: the decimal string
    /// of the secret. Both sides compute the identical secret, so both
    /// derive identical bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.0.to_str_radix(10).into_bytes()
    }
}

// ---------------------------------------------------------------------------
// Exchange operations
// ---------------------------------------------------------------------------

/// Computes `their_public ^ my_private mod modulus`.
///
/// Commutative: each side combining its own private exponent with the
/// other's public value arrives at the identical secret. This is the
/// correctness property the whole protocol depends on.
///
/// # Errors
///
/// [`VeilchatError::CryptoError`] if `their_public` fails
/// [`validate_public_value`]. The check runs before exponentiation so a
/// degenerate value never produces a predictable secret.
pub fn compute_shared_secret(
    their_public: &BigUint,
    my_private: &BigUint,
    modulus: &BigUint,
) -> Result<SharedSecret> {
    validate_public_value(their_public, modulus)?;
    Ok(SharedSecret(their_public.modpow(my_private, modulus)))
}

/// Rejects public values that collapse or break the exchange.
///
/// Accepts only the open interval `(1, p-1)`: the values 0, 1 and p-1
/// produce constant shared secrets, and anything ≥ p is out of range.
pub fn validate_public_value(value: &BigUint, modulus: &BigUint) -> Result<()> {
    let one = BigUint::one();
    if value <= &one {
        return Err(VeilchatError::CryptoError {
            reason: "DH public value must be greater than 1".into(),
        });
    }
    let p_minus_one = modulus - &one;
    if value >= &p_minus_one {
        return Err(VeilchatError::CryptoError {
            reason: "DH public value must be less than p - 1".into(),
        });
    }
    Ok(())
}

/// Validates group parameters received from a peer.
///
/// The responder of a chat exchange receives `(g, p)` from the wire and
/// must not exponentiate in an attacker-chosen degenerate group.
pub fn validate_group(generator: &BigUint, modulus: &BigUint) -> Result<()> {
    if modulus.bits() < MIN_MODULUS_BITS {
        return Err(VeilchatError::CryptoError {
            reason: format!(
                "DH modulus too small: {} bits, need at least {MIN_MODULUS_BITS}",
                modulus.bits()
            ),
        });
    }
    if (modulus % 2u8).is_zero() {
        return Err(VeilchatError::CryptoError {
            reason: "DH modulus must be odd".into(),
        });
    }
    let one = BigUint::one();
    let p_minus_one = modulus - &one;
    if generator <= &one || generator >= &p_minus_one {
        return Err(VeilchatError::CryptoError {
            reason: "DH generator must be in range (1, p-1)".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
