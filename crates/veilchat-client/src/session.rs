//! Per-peer session-key cache and key-exchange bookkeeping.
//!
//! The store is shared between the foreground command path and the
//! background receive loop, so all access goes through one mutex owned
//! by [`crate::connection::Client`].
//!
//! A chat session key exists for a peer only once both halves of that
//! peer's exchange have completed:
//!
//! - **Initiator**: [`SessionKeyStore::initiate_exchange`] records a
//!   [`PendingExchange`] and hands back a oneshot receiver; the receive
//!   loop resolves it when the KEY_REPLY (or an offline notice)
//!   arrives. The waiting side blocks on the receiver with a timeout —
//!   never by polling.
//! - **Responder**: [`SessionKeyStore::complete_as_responder`] needs no
//!   pending state; it derives the key immediately and returns the
//!   public value to send back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use num_bigint::BigUint;
use tokio::sync::oneshot;

use veilchat_crypto::dh::{self, compute_shared_secret, DhKeyPair};
use veilchat_protocol::codec::{open, seal, SealedPayload};
use veilchat_protocol::session::{derive_session_key, SessionKey};
use veilchat_protocol::wire::{KeyExchangePayload, KeyReplyPayload};
use veilchat_types::{KeyContext, Result, Username, VeilchatError};

// ---------------------------------------------------------------------------
// ExchangeSignal
// ---------------------------------------------------------------------------

/// Resolution of an in-flight key exchange, delivered to the waiting
/// initiator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExchangeSignal {
    /// The peer replied; the chat key is in the store.
    Established,
    /// The relay reported the peer offline while the exchange was
    /// pending.
    Offline,
}

// ---------------------------------------------------------------------------
// PendingExchange
// ---------------------------------------------------------------------------

/// Initiator-side state held between KEY_EXCHANGE and KEY_REPLY.
struct PendingExchange {
    private_exponent: BigUint,
    modulus: BigUint,
    created_at: Instant,
}

// ---------------------------------------------------------------------------
// SessionKeyStore
// ---------------------------------------------------------------------------

/// Session keys, pending exchanges, and their completion waiters.
#[derive(Default)]
pub struct SessionKeyStore {
    keys: HashMap<Username, SessionKey>,
    pending: HashMap<Username, PendingExchange>,
    waiters: HashMap<Username, oneshot::Sender<ExchangeSignal>>,
}

impl SessionKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a chat key for `peer` is already established.
    pub fn has_key(&self, peer: &Username) -> bool {
        self.keys.contains_key(peer)
    }

    /// Number of established chat keys.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of exchanges still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Starts an exchange with `peer` in the fixed group.
    ///
    /// Returns the KEY_EXCHANGE payload to transmit and the receiver
    /// the initiator blocks on. A previous pending exchange with the
    /// same peer is superseded.
    pub fn initiate_exchange(
        &mut self,
        peer: &Username,
    ) -> (KeyExchangePayload, oneshot::Receiver<ExchangeSignal>) {
        let keypair = DhKeyPair::generate();

        let payload = KeyExchangePayload {
            public_value: keypair.public_value().clone(),
            g: keypair.generator().clone(),
            p: keypair.modulus().clone(),
        };

        self.pending.insert(
            peer.clone(),
            PendingExchange {
                private_exponent: keypair.private_exponent().clone(),
                modulus: keypair.modulus().clone(),
                created_at: Instant::now(),
            },
        );

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(peer.clone(), tx);

        (payload, rx)
    }

    /// Finishes an exchange this side initiated.
    ///
    /// Consumes the pending entry, derives the chat key, and wakes the
    /// waiting initiator.
    pub fn complete_as_initiator(&mut self, peer: &Username, their_public: &BigUint) -> Result<()> {
        let pending =
            self.pending
                .remove(peer)
                .ok_or_else(|| VeilchatError::ProtocolViolation {
                    reason: format!("no pending key exchange with '{peer}'"),
                })?;

        let secret =
            compute_shared_secret(their_public, &pending.private_exponent, &pending.modulus)?;
        let key = derive_session_key(&secret, KeyContext::Chat)?;
        self.keys.insert(peer.clone(), key);

        if let Some(waiter) = self.waiters.remove(peer) {
            let _ = waiter.send(ExchangeSignal::Established);
        }
        Ok(())
    }

    /// Answers an exchange a peer initiated.
    ///
    /// Validates the offered group and public value, derives the chat
    /// key immediately, and returns the public value for the KEY_REPLY.
    pub fn complete_as_responder(
        &mut self,
        initiator: &Username,
        payload: &KeyExchangePayload,
    ) -> Result<KeyReplyPayload> {
        dh::validate_group(&payload.g, &payload.p)?;
        dh::validate_public_value(&payload.public_value, &payload.p)?;

        let keypair = DhKeyPair::generate_in(payload.g.clone(), payload.p.clone());
        let secret = keypair.shared_secret(&payload.public_value)?;
        let key = derive_session_key(&secret, KeyContext::Chat)?;
        self.keys.insert(initiator.clone(), key);

        Ok(KeyReplyPayload {
            public_value: keypair.public_value().clone(),
        })
    }

    /// Resolves every in-flight exchange as [`ExchangeSignal::Offline`].
    ///
    /// The relay's offline notice does not name the peer, so all
    /// pending targets are treated as unreachable (at most one is
    /// normally in flight). Returns how many exchanges were resolved.
    pub fn mark_pending_offline(&mut self) -> usize {
        let peers: Vec<Username> = self.pending.keys().cloned().collect();
        for peer in &peers {
            self.pending.remove(peer);
            if let Some(waiter) = self.waiters.remove(peer) {
                let _ = waiter.send(ExchangeSignal::Offline);
            }
        }
        peers.len()
    }

    /// Drops the pending exchange with `peer`, if any. Used by the
    /// timeout path; the waiter is dropped unsignaled.
    pub fn discard_pending(&mut self, peer: &Username) {
        self.pending.remove(peer);
        self.waiters.remove(peer);
    }

    /// Drops pending exchanges older than `max_age`. Returns the peers
    /// whose exchanges were discarded.
    pub fn discard_expired(&mut self, max_age: Duration) -> Vec<Username> {
        let now = Instant::now();
        let expired: Vec<Username> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.created_at) >= max_age)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &expired {
            self.discard_pending(peer);
        }
        expired
    }

    /// Seals a plaintext under the chat key for `peer`.
    pub fn seal_for(&self, peer: &Username, plaintext: &[u8]) -> Result<SealedPayload> {
        let key = self
            .keys
            .get(peer)
            .ok_or_else(|| VeilchatError::ProtocolViolation {
                reason: format!("no session key with '{peer}'"),
            })?;
        seal(plaintext, key)
    }

    /// Opens a sealed payload from `peer`.
    ///
    /// Refuses outright when no key is associated with the claimed
    /// sender — an unverified envelope is never decrypted under an
    /// unrelated key.
    pub fn open_from(&self, peer: &Username, sealed: &SealedPayload) -> Result<Vec<u8>> {
        let key = self
            .keys
            .get(peer)
            .ok_or_else(|| VeilchatError::ProtocolViolation {
                reason: format!("no session key with '{peer}'"),
            })?;
        open(sealed, key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Username {
        Username::new("alice").expect("valid")
    }

    fn bob() -> Username {
        Username::new("bob").expect("valid")
    }

    /// Runs both halves of an exchange between two stores, as the
    /// receive loops would.
    fn exchange(initiator: &mut SessionKeyStore, responder: &mut SessionKeyStore) -> Result<()> {
        let (payload, _rx) = initiator.initiate_exchange(&bob());
        let reply = responder.complete_as_responder(&alice(), &payload)?;
        initiator.complete_as_initiator(&bob(), &reply.public_value)
    }

    #[test]
    fn no_key_before_both_halves_complete() {
        let mut store = SessionKeyStore::new();
        let (_payload, _rx) = store.initiate_exchange(&bob());

        assert!(!store.has_key(&bob()));
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn full_exchange_establishes_matching_keys() -> Result<()> {
        let mut alice_store = SessionKeyStore::new();
        let mut bob_store = SessionKeyStore::new();
        exchange(&mut alice_store, &mut bob_store)?;

        assert!(alice_store.has_key(&bob()));
        assert!(bob_store.has_key(&alice()));
        assert_eq!(alice_store.pending_count(), 0);

        // The two sides hold the same key: what one seals the other
        // opens.
        let sealed = alice_store.seal_for(&bob(), b"hello")?;
        let opened = bob_store.open_from(&alice(), &sealed)?;
        assert_eq!(opened, b"hello");
        Ok(())
    }

    #[test]
    fn initiator_waiter_signaled_on_completion() -> Result<()> {
        let mut alice_store = SessionKeyStore::new();
        let mut bob_store = SessionKeyStore::new();

        let (payload, mut rx) = alice_store.initiate_exchange(&bob());
        let reply = bob_store.complete_as_responder(&alice(), &payload)?;
        alice_store.complete_as_initiator(&bob(), &reply.public_value)?;

        assert!(matches!(rx.try_recv(), Ok(ExchangeSignal::Established)));
        Ok(())
    }

    #[test]
    fn offline_notice_resolves_all_pending() {
        let mut store = SessionKeyStore::new();
        let (_p, mut rx) = store.initiate_exchange(&bob());

        assert_eq!(store.mark_pending_offline(), 1);
        assert!(matches!(rx.try_recv(), Ok(ExchangeSignal::Offline)));
        assert_eq!(store.pending_count(), 0);
        assert!(!store.has_key(&bob()));
    }

    #[test]
    fn reply_without_pending_exchange_rejected() {
        let mut store = SessionKeyStore::new();
        let result = store.complete_as_initiator(&bob(), &BigUint::from(12345u32));
        assert!(result.is_err());
    }

    #[test]
    fn degenerate_reply_value_rejected() {
        let mut store = SessionKeyStore::new();
        let (_payload, _rx) = store.initiate_exchange(&bob());

        let result = store.complete_as_initiator(&bob(), &BigUint::from(1u8));
        assert!(result.is_err());
        // The pending entry was consumed; the exchange is dead.
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn responder_rejects_degenerate_group() {
        let mut store = SessionKeyStore::new();
        let payload = KeyExchangePayload {
            public_value: BigUint::from(5u8),
            g: BigUint::from(2u8),
            p: BigUint::from(23u8), // far below the minimum modulus size
        };
        assert!(store.complete_as_responder(&alice(), &payload).is_err());
        assert!(!store.has_key(&alice()));
    }

    #[test]
    fn discard_pending_drops_waiter() {
        let mut store = SessionKeyStore::new();
        let (_p, mut rx) = store.initiate_exchange(&bob());

        store.discard_pending(&bob());
        assert_eq!(store.pending_count(), 0);
        // The waiter side observes the drop as a closed channel.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn discard_expired_prunes_only_old_exchanges() {
        let mut store = SessionKeyStore::new();
        let (_p, _rx) = store.initiate_exchange(&bob());

        assert!(store.discard_expired(Duration::from_secs(60)).is_empty());
        let expired = store.discard_expired(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn seal_without_key_fails_and_leaves_store_unchanged() {
        let store = SessionKeyStore::new();
        assert!(store.seal_for(&bob(), b"hello").is_err());
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn open_from_unknown_sender_refused() -> Result<()> {
        let mut alice_store = SessionKeyStore::new();
        let mut bob_store = SessionKeyStore::new();
        exchange(&mut alice_store, &mut bob_store)?;

        let sealed = alice_store.seal_for(&bob(), b"hello")?;
        let carol = Username::new("carol").expect("valid");
        assert!(bob_store.open_from(&carol, &sealed).is_err());
        Ok(())
    }

    #[test]
    fn new_exchange_supersedes_pending_one() -> Result<()> {
        let mut alice_store = SessionKeyStore::new();
        let mut bob_store = SessionKeyStore::new();

        let (_stale_payload, _stale_rx) = alice_store.initiate_exchange(&bob());
        let (payload, mut rx) = alice_store.initiate_exchange(&bob());
        assert_eq!(alice_store.pending_count(), 1);

        let reply = bob_store.complete_as_responder(&alice(), &payload)?;
        alice_store.complete_as_initiator(&bob(), &reply.public_value)?;
        assert!(matches!(rx.try_recv(), Ok(ExchangeSignal::Established)));
        Ok(())
    }
}
