//! Core shared types for the Veilchat encrypted relay messenger.
//!
//! This crate defines the fundamental types used across the workspace.
//! No other crate should define shared types — everything lives here.

pub mod config;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Username
// ---------------------------------------------------------------------------

/// Identity a user authenticates as and is routed by.
///
/// Usernames are 1–32 ASCII characters from `[A-Za-z0-9._-]`. The name
/// `server` is reserved: relay-originated frames carry it as their sender,
/// so no user may register it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

/// Sender label used by relay-originated frames (AUTH_RESP, LIST, ERROR).
pub const SERVER_SENDER: &str = "server";

/// Maximum username length in characters.
pub const MAX_USERNAME_LEN: usize = 32;

impl Username {
    /// Parses and validates a username.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(VeilchatError::InvalidUsername {
                reason: "username must not be empty".into(),
            });
        }
        if name.len() > MAX_USERNAME_LEN {
            return Err(VeilchatError::InvalidUsername {
                reason: format!(
                    "username must be at most {MAX_USERNAME_LEN} characters, got {}",
                    name.len()
                ),
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(VeilchatError::InvalidUsername {
                reason: "username may only contain ASCII letters, digits, '.', '_', '-'".into(),
            });
        }
        if name.eq_ignore_ascii_case(SERVER_SENDER) {
            return Err(VeilchatError::InvalidUsername {
                reason: format!("'{SERVER_SENDER}' is reserved"),
            });
        }
        Ok(Self(name))
    }

    /// Returns the username as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = VeilchatError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Username> for String {
    fn from(u: Username) -> Self {
        u.0
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = VeilchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// KeyContext
// ---------------------------------------------------------------------------

/// Domain separator for session-key derivation.
///
/// A key derived for one context can never be substituted for the other:
/// each context contributes its own KDF salt, so even an identical shared
/// secret yields unrelated keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum KeyContext {
    /// Client ↔ relay transport key, established before authentication.
    Prelogin,
    /// Client ↔ client end-to-end key.
    Chat,
}

impl KeyContext {
    /// KDF salt bound to this context.
    pub fn salt(&self) -> &'static [u8] {
        match self {
            Self::Prelogin => b"prelogin",
            Self::Chat => b"chat",
        }
    }
}

impl fmt::Display for KeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prelogin => write!(f, "prelogin"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

// ---------------------------------------------------------------------------
// VeilchatError
// ---------------------------------------------------------------------------

/// Central error type for the Veilchat system.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum, ensuring a unified error handling surface.
#[derive(Debug, Error)]
pub enum VeilchatError {
    /// A username failed validation.
    #[error("invalid username: {reason}")]
    InvalidUsername {
        /// Human-readable description of the validation failure.
        reason: String,
    },

    /// A frame arrived that the current protocol phase does not accept.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Human-readable description of the violation.
        reason: String,
    },

    /// An outer tag or AEAD tag failed verification.
    #[error("integrity failure: {reason}")]
    IntegrityFailure {
        /// Human-readable description of the integrity failure.
        reason: String,
    },

    /// Credentials were rejected (wrong password or lockout).
    #[error("authentication failure: {reason}")]
    AuthenticationFailure {
        /// Human-readable description of the rejection.
        reason: String,
    },

    /// No KEY_REPLY arrived within the exchange timeout.
    #[error("key exchange with '{peer}' timed out")]
    ExchangeTimeout {
        /// Peer the exchange was initiated with.
        peer: String,
    },

    /// The target identity is not currently registered with the relay.
    #[error("recipient '{recipient}' is offline")]
    RecipientOffline {
        /// The unreachable recipient.
        recipient: String,
    },

    /// A socket or framing operation failed.
    #[error("transport failure: {reason}")]
    TransportFailure {
        /// Human-readable description of the transport failure.
        reason: String,
    },

    /// A cryptographic operation failed (key generation, derivation,
    /// encryption, decryption setup).
    #[error("crypto error: {reason}")]
    CryptoError {
        /// Human-readable description of the cryptographic failure.
        reason: String,
    },

    /// A user-store read or write failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`VeilchatError`].
pub type Result<T> = std::result::Result<T, VeilchatError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_accepts_common_forms() -> Result<()> {
        Username::new("alice")?;
        Username::new("bob_42")?;
        Username::new("carol.d-e")?;
        Ok(())
    }

    #[test]
    fn username_rejects_empty() {
        assert!(Username::new("").is_err());
    }

    #[test]
    fn username_rejects_too_long() {
        let name = "a".repeat(MAX_USERNAME_LEN + 1);
        assert!(Username::new(name).is_err());
    }

    #[test]
    fn username_rejects_whitespace_and_symbols() {
        assert!(Username::new("ali ce").is_err());
        assert!(Username::new("alice!").is_err());
        assert!(Username::new("al/ce").is_err());
    }

    #[test]
    fn username_rejects_reserved_server_name() {
        assert!(Username::new("server").is_err());
        assert!(Username::new("SERVER").is_err());
        assert!(Username::new("Server").is_err());
    }

    #[test]
    fn username_serde_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let u = Username::new("alice")?;
        let json = serde_json::to_string(&u)?;
        assert_eq!(json, "\"alice\"");
        let parsed: Username = serde_json::from_str(&json)?;
        assert_eq!(u, parsed);
        Ok(())
    }

    #[test]
    fn username_serde_rejects_invalid() {
        let result: std::result::Result<Username, _> = serde_json::from_str("\"not valid!\"");
        assert!(result.is_err());
    }

    #[test]
    fn key_context_salts_differ() {
        assert_ne!(KeyContext::Prelogin.salt(), KeyContext::Chat.salt());
    }

    #[test]
    fn key_context_display() {
        assert_eq!(KeyContext::Prelogin.to_string(), "prelogin");
        assert_eq!(KeyContext::Chat.to_string(), "chat");
    }

    #[test]
    fn error_display() {
        let err = VeilchatError::RecipientOffline {
            recipient: "bob".into(),
        };
        assert!(err.to_string().contains("bob"));
        assert!(err.to_string().contains("offline"));
    }
}
