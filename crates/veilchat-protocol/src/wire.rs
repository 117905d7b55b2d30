//! Logical frame schema exchanged over the relay.
//!
//! Frames are tagged by a `type` field. The relay inspects only the
//! tag, `sender` and `recipient` — payloads of peer-to-peer frames stay
//! opaque to it. Big integers travel as decimal strings (JSON numbers
//! cannot carry 3072-bit values), binary fields as base64 inside the
//! [`crate::codec::EncryptedEnvelope`].
//!
//! | type         | direction        | payload                          |
//! |--------------|------------------|----------------------------------|
//! | KEY_EXCHANGE | both             | `{pubA, g, p}`                   |
//! | KEY_REPLY    | both             | `{pubB}`                         |
//! | AUTH         | client → relay   | sealed credentials               |
//! | AUTH_RESP    | relay → client   | sealed "OK" / reason             |
//! | LIST         | both             | sealed request / username list   |
//! | MESSAGE      | client → client  | sealed chat text                 |
//! | ERROR        | relay → client   | sealed reason (plaintext pre-key)|
//! | LOGOUT       | client → relay   | none                             |
//!
//! Frames carrying a sealed payload under the transport key (AUTH,
//! AUTH_RESP, LIST, ERROR) inline its `enc` and `hmac` fields;
//! MESSAGE nests them under `payload` because the relay must forward
//! that object untouched.

use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::codec::SealedPayload;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One protocol frame.
///
/// `sender`/`recipient` are plain strings at this layer; endpoints
/// validate them into [`veilchat_types::Username`] where identity
/// matters. The relay's own frames carry the reserved sender
/// [`veilchat_types::SERVER_SENDER`], which no user may register.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initiator's half of a Diffie-Hellman exchange. Without a
    /// recipient it addresses the relay (transport key); with one it is
    /// forwarded to the named peer (chat key).
    #[serde(rename = "KEY_EXCHANGE")]
    KeyExchange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        payload: KeyExchangePayload,
    },

    /// Responder's half of a Diffie-Hellman exchange.
    #[serde(rename = "KEY_REPLY")]
    KeyReply {
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        payload: KeyReplyPayload,
    },

    /// Credentials sealed under the transport key. The claimed username
    /// lives inside the sealed [`Credentials`], not on the frame.
    #[serde(rename = "AUTH")]
    Auth {
        #[serde(flatten)]
        sealed: SealedPayload,
    },

    /// Authentication acknowledgment, sealed under the transport key.
    #[serde(rename = "AUTH_RESP")]
    AuthResp {
        sender: String,
        #[serde(flatten)]
        sealed: SealedPayload,
    },

    /// Online-users request (client → relay) or response (relay →
    /// client), sealed under the transport key in both directions.
    #[serde(rename = "LIST")]
    List {
        sender: String,
        #[serde(flatten)]
        sealed: SealedPayload,
    },

    /// End-to-end encrypted chat message; the relay forwards it
    /// unmodified and cannot open the payload.
    #[serde(rename = "MESSAGE")]
    Direct {
        sender: String,
        recipient: String,
        payload: SealedPayload,
    },

    /// Failure notice. Sealed under the transport key once one exists;
    /// plaintext `payload` only in the pre-key phase.
    #[serde(rename = "ERROR")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
        #[serde(flatten)]
        sealed: Option<SealedPayload>,
    },

    /// Session termination request. The relay acknowledges with a
    /// sealed AUTH_RESP, then closes.
    #[serde(rename = "LOGOUT")]
    Logout { sender: String },
}

impl Frame {
    /// AUTH frame from a sealed credentials payload.
    pub fn auth(sealed: SealedPayload) -> Self {
        Self::Auth { sealed }
    }

    /// AUTH_RESP frame from a sealed acknowledgment.
    pub fn auth_resp(sender: impl Into<String>, sealed: SealedPayload) -> Self {
        Self::AuthResp {
            sender: sender.into(),
            sealed,
        }
    }

    /// LIST frame (request or response) from a sealed payload.
    pub fn list(sender: impl Into<String>, sealed: SealedPayload) -> Self {
        Self::List {
            sender: sender.into(),
            sealed,
        }
    }

    /// Sealed ERROR notice.
    pub fn sealed_error(sender: impl Into<String>, sealed: SealedPayload) -> Self {
        Self::Error {
            sender: Some(sender.into()),
            payload: None,
            sealed: Some(sealed),
        }
    }

    /// Plaintext ERROR notice for the pre-key phase.
    pub fn plain_error(sender: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Error {
            sender: Some(sender.into()),
            payload: Some(reason.into()),
            sealed: None,
        }
    }

    /// Returns the frame's kind tag.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::KeyExchange { .. } => FrameKind::KeyExchange,
            Self::KeyReply { .. } => FrameKind::KeyReply,
            Self::Auth { .. } => FrameKind::Auth,
            Self::AuthResp { .. } => FrameKind::AuthResp,
            Self::List { .. } => FrameKind::List,
            Self::Direct { .. } => FrameKind::Direct,
            Self::Error { .. } => FrameKind::Error,
            Self::Logout { .. } => FrameKind::Logout,
        }
    }
}

// ---------------------------------------------------------------------------
// FrameKind
// ---------------------------------------------------------------------------

/// Discriminant of [`Frame`], used by the protocol state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FrameKind {
    KeyExchange,
    KeyReply,
    Auth,
    AuthResp,
    List,
    Direct,
    Error,
    Logout,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KeyExchange => "KEY_EXCHANGE",
            Self::KeyReply => "KEY_REPLY",
            Self::Auth => "AUTH",
            Self::AuthResp => "AUTH_RESP",
            Self::List => "LIST",
            Self::Direct => "MESSAGE",
            Self::Error => "ERROR",
            Self::Logout => "LOGOUT",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Public half of a Diffie-Hellman exchange plus the group parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    /// Initiator's public value.
    #[serde(rename = "pubA", with = "biguint_dec")]
    pub public_value: BigUint,
    /// Group generator.
    #[serde(with = "biguint_dec")]
    pub g: BigUint,
    /// Group modulus.
    #[serde(with = "biguint_dec")]
    pub p: BigUint,
}

/// Responder's public value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyReplyPayload {
    /// Responder's public value in the initiator's group.
    #[serde(rename = "pubB", with = "biguint_dec")]
    pub public_value: BigUint,
}

/// Inner plaintext of an AUTH frame, sealed under the transport key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    /// Username the client claims.
    pub sender: String,
    /// Always `null`; present for schema symmetry with other frames.
    pub recipient: Option<String>,
    /// The secret itself.
    pub payload: CredentialsPayload,
}

/// Password carrier inside [`Credentials`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialsPayload {
    pub password: String,
}

impl Credentials {
    /// Builds the credentials blob for `username` / `password`.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            sender: username.into(),
            recipient: None,
            payload: CredentialsPayload {
                password: password.into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Decimal big-integer encoding
// ---------------------------------------------------------------------------

mod biguint_dec {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(de)?;
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(de::Error::custom("invalid decimal big integer"));
        }
        BigUint::parse_bytes(s.as_bytes(), 10)
            .ok_or_else(|| de::Error::custom("invalid decimal big integer"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
