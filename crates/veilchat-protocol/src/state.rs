//! Per-connection protocol state machine.
//!
//! Governs which frame kinds a relay connection may receive at each
//! phase. The relay drives one [`ProtocolState`] per connection:
//!
//! ```text
//! Connected ──KEY_EXCHANGE──► TransportEstablished ──AUTH──► Authenticating
//!                                      ▲                          │
//!                                      └───── auth rejected ──────┤
//!                                                                 ▼
//!                        Closed ◄──LOGOUT── Authenticated ◄── auth accepted
//! ```
//!
//! A violation in the `Connected` phase is fatal (the transport key
//! exchange is the one message that must come first); all later
//! violations are answered with an ERROR and leave the phase unchanged.

use std::fmt;

use veilchat_types::VeilchatError;

use crate::wire::FrameKind;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of one relay connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Socket accepted; no transport key yet.
    Connected,
    /// Transport key derived; awaiting credentials.
    TransportEstablished,
    /// Credentials received and being verified.
    Authenticating,
    /// Identity registered; full command set available.
    Authenticated,
    /// Terminal. No further frames are accepted.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::TransportEstablished => "transport-established",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Violation
// ---------------------------------------------------------------------------

/// A frame kind the current phase does not accept.
#[derive(Debug)]
pub struct Violation {
    /// What went wrong, phrased for the ERROR response.
    pub reason: String,
    /// Whether the connection must be closed (only the missing
    /// transport key exchange is fatal).
    pub fatal: bool,
}

impl From<Violation> for VeilchatError {
    fn from(v: Violation) -> Self {
        VeilchatError::ProtocolViolation { reason: v.reason }
    }
}

// ---------------------------------------------------------------------------
// ProtocolState
// ---------------------------------------------------------------------------

/// State machine for frames received on one relay connection.
#[derive(Debug)]
pub struct ProtocolState {
    phase: Phase,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolState {
    /// Starts in [`Phase::Connected`].
    pub fn new() -> Self {
        Self {
            phase: Phase::Connected,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Feeds one received frame kind through the machine.
    ///
    /// On acceptance the phase advances where the table says so and
    /// `Ok(())` is returned. On violation the phase is left unchanged
    /// (the caller answers with an ERROR) unless the violation is
    /// fatal, in which case the phase moves to [`Phase::Closed`].
    pub fn accept(&mut self, kind: FrameKind) -> Result<(), Violation> {
        match self.phase {
            Phase::Connected => {
                if kind == FrameKind::KeyExchange {
                    self.phase = Phase::TransportEstablished;
                    Ok(())
                } else {
                    self.phase = Phase::Closed;
                    Err(Violation {
                        reason: "Expected key exchange".into(),
                        fatal: true,
                    })
                }
            }
            Phase::TransportEstablished => {
                if kind == FrameKind::Auth {
                    self.phase = Phase::Authenticating;
                    Ok(())
                } else {
                    Err(Violation {
                        reason: "Expected AUTH".into(),
                        fatal: false,
                    })
                }
            }
            Phase::Authenticating => Err(Violation {
                reason: "Authentication in progress".into(),
                fatal: false,
            }),
            Phase::Authenticated => match kind {
                FrameKind::List
                | FrameKind::Direct
                | FrameKind::KeyExchange
                | FrameKind::KeyReply => Ok(()),
                FrameKind::Logout => {
                    self.phase = Phase::Closed;
                    Ok(())
                }
                FrameKind::Auth | FrameKind::AuthResp | FrameKind::Error => Err(Violation {
                    reason: format!("Unexpected {kind} after authentication"),
                    fatal: false,
                }),
            },
            Phase::Closed => Err(Violation {
                reason: "Connection is closed".into(),
                fatal: true,
            }),
        }
    }

    /// Resolves the pending authentication attempt.
    ///
    /// `true` moves to [`Phase::Authenticated`]; `false` returns to
    /// [`Phase::TransportEstablished`] so the client may retry.
    pub fn auth_resolved(&mut self, success: bool) {
        if self.phase == Phase::Authenticating {
            self.phase = if success {
                Phase::Authenticated
            } else {
                Phase::TransportEstablished
            };
        }
    }

    /// Marks the connection closed (transport error, lockout, EOF).
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
