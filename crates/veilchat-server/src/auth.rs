//! Password authentication with trust-on-first-use registration and
//! sliding-window login throttling.
//!
//! The verifier scheme: `verifier = PBKDF2(password, salt)` with a
//! random 16-byte per-user salt. An unseen username is registered on
//! its first login attempt; a known username has its password
//! recomputed and compared against the stored verifier in constant
//! time.
//!
//! Throttling is a per-username sliding window of failure timestamps.
//! Once the window holds `max_login_attempts` failures, the username is
//! locked for the remainder of the window — a correct password during
//! lockout is still refused.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use veilchat_crypto::kdf::{pbkdf2_derive_key, KdfParams};
use veilchat_types::config::ProtocolConfig;
use veilchat_types::{Result, Username, VeilchatError};

use crate::users::{InsertOutcome, UserRecord, UserStore};

// ---------------------------------------------------------------------------
// AuthOutcome
// ---------------------------------------------------------------------------

/// Result of one authentication attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthOutcome {
    /// Credentials verified (or the username was just registered).
    Accepted,
    /// Wrong password; the client may retry.
    Rejected,
    /// Too many recent failures; the connection must be closed.
    LockedOut,
}

// ---------------------------------------------------------------------------
// AttemptTracker
// ---------------------------------------------------------------------------

/// Per-username sliding window of login failures.
///
/// Thread-safe via `std::sync::Mutex`. Entries older than the window
/// are pruned before every check, so idle usernames cost nothing after
/// one window width.
pub struct AttemptTracker {
    windows: Mutex<HashMap<Username, Vec<Instant>>>,
    max_attempts: usize,
    window: Duration,
}

impl AttemptTracker {
    /// Creates a tracker allowing `max_attempts` failures per `window`.
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_attempts,
            window,
        }
    }

    /// Returns `true` if the username is currently locked out.
    pub fn is_locked(&self, username: &Username) -> Result<bool> {
        let mut windows = self.windows.lock().map_err(|_| VeilchatError::StorageError {
            reason: "attempt tracker lock poisoned".into(),
        })?;

        let now = Instant::now();
        match windows.get_mut(username) {
            Some(failures) => {
                Self::prune(failures, now, self.window);
                if failures.is_empty() {
                    windows.remove(username);
                    Ok(false)
                } else {
                    Ok(failures.len() >= self.max_attempts)
                }
            }
            None => Ok(false),
        }
    }

    /// Records a failure and reports whether the username just crossed
    /// into lockout.
    pub fn record_failure(&self, username: &Username) -> Result<bool> {
        let mut windows = self.windows.lock().map_err(|_| VeilchatError::StorageError {
            reason: "attempt tracker lock poisoned".into(),
        })?;

        let now = Instant::now();
        let failures = windows.entry(username.clone()).or_default();
        Self::prune(failures, now, self.window);
        failures.push(now);
        Ok(failures.len() >= self.max_attempts)
    }

    /// Number of usernames currently tracked. Useful for monitoring
    /// and tests.
    pub fn tracked_usernames(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn prune(failures: &mut Vec<Instant>, now: Instant, window: Duration) {
        failures.retain(|t| now.duration_since(*t) < window);
    }
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Verifier checks, registration-on-first-use, and lockout policy.
pub struct AuthService {
    store: UserStore,
    attempts: AttemptTracker,
    kdf: KdfParams,
}

impl AuthService {
    /// Creates the service with the protocol-default KDF cost.
    pub fn new(store: UserStore, config: &ProtocolConfig) -> Self {
        Self::with_kdf(store, config, KdfParams::default())
    }

    /// Creates the service with explicit KDF parameters. Tests use a
    /// lighter iteration count.
    pub fn with_kdf(store: UserStore, config: &ProtocolConfig, kdf: KdfParams) -> Self {
        Self {
            store,
            attempts: AttemptTracker::new(
                config.max_login_attempts as usize,
                Duration::from_secs(config.login_window_secs),
            ),
            kdf,
        }
    }

    /// Runs one authentication attempt for `username`.
    ///
    /// The lockout check comes first: a username inside an exhausted
    /// window is refused before any verifier work, even with the
    /// correct password. An unseen username is registered atomically
    /// (the store serializes concurrent first-use races; the loser
    /// verifies against the record that won).
    pub fn authenticate(&self, username: &Username, password: &str) -> Result<AuthOutcome> {
        if self.attempts.is_locked(username)? {
            return Ok(AuthOutcome::LockedOut);
        }

        let record = match self.store.get(username)? {
            Some(record) => record,
            None => {
                let mut salt = [0u8; UserRecord::SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                let verifier =
                    pbkdf2_derive_key(password.as_bytes(), &salt, &self.kdf)?.to_bytes();

                match self
                    .store
                    .insert_if_absent(username, UserRecord::new(salt, verifier))?
                {
                    InsertOutcome::Inserted => {
                        tracing::info!(user = %username, "created user");
                        return Ok(AuthOutcome::Accepted);
                    }
                    InsertOutcome::AlreadyExists(existing) => existing,
                }
            }
        };

        let derived = pbkdf2_derive_key(password.as_bytes(), record.salt(), &self.kdf)?;
        let matches: bool = record
            .verifier()
            .ct_eq(derived.as_bytes())
            .into();

        if matches {
            Ok(AuthOutcome::Accepted)
        } else if self.attempts.record_failure(username)? {
            Ok(AuthOutcome::LockedOut)
        } else {
            Ok(AuthOutcome::Rejected)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_store_path() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "veilchat-auth-test-{}-{}-{}.json",
            std::process::id(),
            id,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0),
        ))
    }

    /// Light KDF so the lockout loops stay fast.
    fn service() -> AuthService {
        service_with_config(&ProtocolConfig::default())
    }

    fn service_with_config(config: &ProtocolConfig) -> AuthService {
        let store = UserStore::open(temp_store_path()).expect("open store");
        AuthService::with_kdf(store, config, KdfParams { iterations: 500 })
    }

    fn alice() -> Username {
        Username::new("alice").expect("valid")
    }

    #[test]
    fn first_login_registers_and_accepts() -> Result<()> {
        let auth = service();
        assert_eq!(auth.authenticate(&alice(), "p1")?, AuthOutcome::Accepted);
        Ok(())
    }

    #[test]
    fn correct_password_accepted_after_registration() -> Result<()> {
        let auth = service();
        auth.authenticate(&alice(), "p1")?;
        assert_eq!(auth.authenticate(&alice(), "p1")?, AuthOutcome::Accepted);
        Ok(())
    }

    #[test]
    fn wrong_password_rejected() -> Result<()> {
        let auth = service();
        auth.authenticate(&alice(), "p1")?;
        assert_eq!(auth.authenticate(&alice(), "p2")?, AuthOutcome::Rejected);
        Ok(())
    }

    #[test]
    fn registration_does_not_capture_second_password() -> Result<()> {
        let auth = service();
        auth.authenticate(&alice(), "p1")?;
        // A second "first login" with a different password must not
        // overwrite the record.
        assert_eq!(auth.authenticate(&alice(), "p2")?, AuthOutcome::Rejected);
        assert_eq!(auth.authenticate(&alice(), "p1")?, AuthOutcome::Accepted);
        Ok(())
    }

    #[test]
    fn fifth_failure_locks_out() -> Result<()> {
        let auth = service();
        auth.authenticate(&alice(), "p1")?;

        for _ in 0..4 {
            assert_eq!(auth.authenticate(&alice(), "wrong")?, AuthOutcome::Rejected);
        }
        assert_eq!(auth.authenticate(&alice(), "wrong")?, AuthOutcome::LockedOut);
        Ok(())
    }

    #[test]
    fn correct_password_refused_during_lockout() -> Result<()> {
        let auth = service();
        auth.authenticate(&alice(), "p1")?;

        for _ in 0..5 {
            auth.authenticate(&alice(), "wrong")?;
        }
        assert_eq!(auth.authenticate(&alice(), "p1")?, AuthOutcome::LockedOut);
        Ok(())
    }

    #[test]
    fn lockout_expires_with_the_window() -> Result<()> {
        let config = ProtocolConfig {
            max_login_attempts: 2,
            login_window_secs: 1,
            ..Default::default()
        };
        let auth = service_with_config(&config);
        auth.authenticate(&alice(), "p1")?;

        auth.authenticate(&alice(), "wrong")?;
        assert_eq!(auth.authenticate(&alice(), "wrong")?, AuthOutcome::LockedOut);
        assert_eq!(auth.authenticate(&alice(), "p1")?, AuthOutcome::LockedOut);

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(auth.authenticate(&alice(), "p1")?, AuthOutcome::Accepted);
        Ok(())
    }

    #[test]
    fn usernames_throttled_independently() -> Result<()> {
        let auth = service();
        let bob = Username::new("bob").expect("valid");
        auth.authenticate(&alice(), "p1")?;
        auth.authenticate(&bob, "p2")?;

        for _ in 0..5 {
            auth.authenticate(&alice(), "wrong")?;
        }
        assert_eq!(auth.authenticate(&alice(), "p1")?, AuthOutcome::LockedOut);
        assert_eq!(auth.authenticate(&bob, "p2")?, AuthOutcome::Accepted);
        Ok(())
    }

    #[test]
    fn tracker_prunes_idle_usernames() -> Result<()> {
        let tracker = AttemptTracker::new(3, Duration::from_millis(50));
        let user = alice();

        tracker.record_failure(&user)?;
        assert_eq!(tracker.tracked_usernames(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert!(!tracker.is_locked(&user)?);
        assert_eq!(tracker.tracked_usernames(), 0);
        Ok(())
    }
}
