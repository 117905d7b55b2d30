//! On-disk user record store.
//!
//! A single JSON file mapping `username -> {salt, verifier}` (both
//! base64). Two logical operations: read-all at open, write-all on
//! change. All writes are atomic: serialize → write tmp → fsync →
//! rename, so a crash never leaves a torn file.
//!
//! Passwords are never stored; only the PBKDF2 verifier and its salt.
//! Verifier comparison happens in `auth`, in constant time.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use veilchat_types::{Result, Username, VeilchatError};

// ---------------------------------------------------------------------------
// UserRecord
// ---------------------------------------------------------------------------

/// Stored credential material for one username.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    /// Random per-user salt.
    #[serde(with = "b64_arr")]
    salt: [u8; 16],
    /// `PBKDF2(password, salt)`.
    #[serde(with = "b64_arr")]
    verifier: [u8; 32],
}

impl UserRecord {
    /// Byte length of the per-user salt.
    pub const SALT_LEN: usize = 16;

    /// Bundles salt and verifier into a record.
    pub fn new(salt: [u8; 16], verifier: [u8; 32]) -> Self {
        Self { salt, verifier }
    }

    /// The per-user salt.
    pub fn salt(&self) -> &[u8; 16] {
        &self.salt
    }

    /// The stored verifier.
    pub fn verifier(&self) -> &[u8; 32] {
        &self.verifier
    }
}

// ---------------------------------------------------------------------------
// UserStore
// ---------------------------------------------------------------------------

/// Outcome of a trust-on-first-use insertion attempt.
pub enum InsertOutcome {
    /// The record was created and persisted.
    Inserted,
    /// Another registration won the race; here is the surviving record.
    AlreadyExists(UserRecord),
}

/// Thread-safe user store backed by one JSON file.
///
/// The in-memory map is authoritative after [`UserStore::open`]; every
/// mutation rewrites the file before releasing the lock, so the
/// read-then-write registration sequence is atomic with respect to
/// concurrent registrations of the same username.
pub struct UserStore {
    path: PathBuf,
    records: Mutex<HashMap<Username, UserRecord>>,
}

impl UserStore {
    /// Opens the store, loading existing records if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| VeilchatError::StorageError {
                reason: format!("failed to read user store: {e}"),
            })?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| VeilchatError::StorageError {
                    reason: format!("user store is corrupt: {e}"),
                })?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Looks up a record by username.
    pub fn get(&self, username: &Username) -> Result<Option<UserRecord>> {
        let records = self.records.lock().map_err(|_| VeilchatError::StorageError {
            reason: "user store lock poisoned".into(),
        })?;
        Ok(records.get(username).cloned())
    }

    /// Inserts a record only if the username is unseen, persisting the
    /// change before returning.
    ///
    /// When two first-use registrations race, exactly one inserts; the
    /// loser receives the surviving record via
    /// [`InsertOutcome::AlreadyExists`] and verifies against it.
    pub fn insert_if_absent(&self, username: &Username, record: UserRecord) -> Result<InsertOutcome> {
        let mut records = self.records.lock().map_err(|_| VeilchatError::StorageError {
            reason: "user store lock poisoned".into(),
        })?;

        if let Some(existing) = records.get(username) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }

        records.insert(username.clone(), record);
        self.persist(&records)?;
        Ok(InsertOutcome::Inserted)
    }

    /// Number of stored records. Useful for monitoring and tests.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns `true` if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the full map atomically: tmp file, fsync, rename.
    fn persist(&self, records: &HashMap<Username, UserRecord>) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(records).map_err(|e| VeilchatError::StorageError {
                reason: format!("failed to serialize user store: {e}"),
            })?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path).map_err(|e| VeilchatError::StorageError {
            reason: format!("failed to create temp user store: {e}"),
        })?;
        tmp.write_all(&json).map_err(|e| VeilchatError::StorageError {
            reason: format!("failed to write temp user store: {e}"),
        })?;
        tmp.sync_all().map_err(|e| VeilchatError::StorageError {
            reason: format!("failed to sync temp user store: {e}"),
        })?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| VeilchatError::StorageError {
            reason: format!("failed to replace user store: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// base64 field encoding
// ---------------------------------------------------------------------------

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
