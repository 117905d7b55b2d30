//! Protocol tunables with sensible defaults.
//!
//! All operational parameters of the session and authentication protocol
//! are centralized here. Every value has a documented default matching the
//! deployed protocol; both the server and the client construct their
//! behavior from this one struct.

use serde::{Deserialize, Serialize};

use crate::{Result, VeilchatError};

/// Protocol-level configuration shared by server and client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Failed login attempts tolerated per username inside the sliding
    /// window before the connection is forcibly closed.
    pub max_login_attempts: u32,

    /// Width of the login-failure sliding window, in seconds. Failures
    /// older than this are pruned before each check.
    pub login_window_secs: u64,

    /// How long an initiator waits for a KEY_REPLY before giving up, in
    /// seconds. Expiry discards the pending exchange.
    pub exchange_timeout_secs: u64,

    /// Login prompts the client offers before exiting. Independent of the
    /// server-side lockout.
    pub client_max_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 5,
            login_window_secs: 60,
            exchange_timeout_secs: 5,
            client_max_retries: 3,
        }
    }
}

impl ProtocolConfig {
    /// Validates all configuration values.
    ///
    /// Returns an error if any value is outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.max_login_attempts == 0 {
            return Err(VeilchatError::ConfigError {
                reason: "max_login_attempts must be greater than 0".into(),
            });
        }

        if self.login_window_secs == 0 {
            return Err(VeilchatError::ConfigError {
                reason: "login_window_secs must be greater than 0".into(),
            });
        }

        if self.exchange_timeout_secs == 0 {
            return Err(VeilchatError::ConfigError {
                reason: "exchange_timeout_secs must be greater than 0".into(),
            });
        }

        if self.client_max_retries == 0 {
            return Err(VeilchatError::ConfigError {
                reason: "client_max_retries must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        ProtocolConfig::default().validate()
    }

    #[test]
    fn default_values_match_protocol() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.max_login_attempts, 5);
        assert_eq!(cfg.login_window_secs, 60);
        assert_eq!(cfg.exchange_timeout_secs, 5);
        assert_eq!(cfg.client_max_retries, 3);
    }

    #[test]
    fn zero_attempts_rejected() {
        let cfg = ProtocolConfig {
            max_login_attempts: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_window_rejected() {
        let cfg = ProtocolConfig {
            login_window_secs: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let cfg = ProtocolConfig {
            exchange_timeout_secs: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_serde_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let cfg = ProtocolConfig::default();
        let json = serde_json::to_string(&cfg)?;
        let parsed: ProtocolConfig = serde_json::from_str(&json)?;
        assert_eq!(parsed.max_login_attempts, cfg.max_login_attempts);
        assert_eq!(parsed.login_window_secs, cfg.login_window_secs);
        Ok(())
    }
}
