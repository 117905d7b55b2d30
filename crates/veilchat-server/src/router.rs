//! Identity → connection routing table.
//!
//! Each authenticated connection registers its username together with
//! the sending half of its outbound channel. Forwarding pushes the raw
//! serialized frame — still end-to-end encrypted — onto the recipient's
//! channel; the relay never parses or re-seals forwarded payloads.
//!
//! All table access goes through one mutex, so register / unregister /
//! forward calls from concurrent connection tasks are linearizable.
//! The map is never exposed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use veilchat_types::{Result, Username, VeilchatError};

// ---------------------------------------------------------------------------
// ConnectionId
// ---------------------------------------------------------------------------

/// Handle identifying one accepted connection for the lifetime of the
/// process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct Entry {
    conn_id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
}

/// Thread-safe username → connection table.
///
/// Exactly one entry per username: a re-login replaces the previous
/// entry (newest connection wins), and unregistration is keyed by
/// [`ConnectionId`] so a stale connection's cleanup never evicts its
/// successor.
#[derive(Default)]
pub struct Router {
    entries: Mutex<HashMap<Username, Entry>>,
}

impl Router {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `username` on the given connection. Newest wins: an
    /// existing entry for the same username is replaced.
    pub fn register(
        &self,
        username: Username,
        conn_id: ConnectionId,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        let mut entries = self.lock()?;
        if let Some(previous) = entries.insert(username.clone(), Entry { conn_id, outbound }) {
            tracing::warn!(
                user = %username,
                old = %previous.conn_id,
                new = %conn_id,
                "duplicate login replaced existing connection"
            );
        }
        Ok(())
    }

    /// Removes the entry owned by `conn_id`, if any. Idempotent, and a
    /// no-op when the username has since been taken over by a newer
    /// connection.
    pub fn unregister(&self, conn_id: ConnectionId) -> Result<()> {
        let mut entries = self.lock()?;
        entries.retain(|_, entry| entry.conn_id != conn_id);
        Ok(())
    }

    /// Forwards a raw serialized frame to `recipient`.
    ///
    /// The frame is delivered unmodified. A recipient with no live
    /// entry — or one whose connection task has already gone away —
    /// yields [`VeilchatError::RecipientOffline`].
    pub fn forward(&self, recipient: &Username, raw: String) -> Result<()> {
        let mut entries = self.lock()?;
        match entries.get(recipient) {
            Some(entry) => {
                if entry.outbound.send(raw).is_err() {
                    // The connection task dropped its receiver; treat
                    // the recipient as gone and drop the dead entry.
                    entries.remove(recipient);
                    Err(VeilchatError::RecipientOffline {
                        recipient: recipient.to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            None => Err(VeilchatError::RecipientOffline {
                recipient: recipient.to_string(),
            }),
        }
    }

    /// Snapshot of currently registered usernames, sorted.
    pub fn list_online(&self) -> Result<Vec<Username>> {
        let entries = self.lock()?;
        let mut names: Vec<Username> = entries.keys().cloned().collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(names)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Username, Entry>>> {
        self.entries.lock().map_err(|_| VeilchatError::TransportFailure {
            reason: "router lock poisoned".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
