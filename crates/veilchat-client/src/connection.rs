//! Relay connection: handshake, login, receive loop, and commands.
//!
//! Connection lifecycle:
//!
//! 1. [`Connection::establish`] — TCP connect, transport key exchange
//!    with the relay (prelogin context).
//! 2. [`Connection::login`] — one AUTH attempt under the transport key;
//!    the caller owns the retry loop.
//! 3. [`Connection::start`] — splits into a writer task and a receive
//!    loop, returning the [`Client`] command surface plus the event
//!    channel.
//!
//! The receive loop dispatches incoming frames: it answers peer
//! KEY_EXCHANGEs automatically, resolves pending exchanges on
//! KEY_REPLY, decrypts direct messages, and surfaces relay notices.
//! Everything user-visible flows through [`ClientEvent`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use veilchat_crypto::dh::DhKeyPair;
use veilchat_protocol::codec::{open_text, seal};
use veilchat_protocol::session::{derive_session_key, SessionKey};
use veilchat_protocol::transport::{read_frame, write_frame};
use veilchat_protocol::wire::{Credentials, Frame, KeyExchangePayload};
use veilchat_types::config::ProtocolConfig;
use veilchat_types::{KeyContext, Result, Username, VeilchatError};

use crate::session::{ExchangeSignal, SessionKeyStore};

// ---------------------------------------------------------------------------
// ClientEvent
// ---------------------------------------------------------------------------

/// Events surfaced by the receive loop.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// A decrypted chat message attributed to `from`.
    Direct {
        /// Verified-session sender.
        from: Username,
        /// Decrypted message text.
        text: String,
    },
    /// Response to a LIST request.
    OnlineUsers(Vec<String>),
    /// A sealed notice from the relay (acknowledgments, errors).
    ServerNotice(String),
    /// A frame was dropped for security reasons (bad integrity,
    /// unknown sender, malformed content).
    SecurityAlert(String),
    /// The connection is gone; no further events will arrive.
    Closed,
}

// ---------------------------------------------------------------------------
// Connection (pre-login)
// ---------------------------------------------------------------------------

/// A relay connection with an established transport key, not yet
/// authenticated.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    transport_key: SessionKey,
    config: ProtocolConfig,
}

impl Connection {
    /// Connects to the relay and runs the transport key exchange.
    pub async fn establish(addr: &str, config: ProtocolConfig) -> Result<Self> {
        config.validate()?;

        let stream =
            TcpStream::connect(addr)
                .await
                .map_err(|e| VeilchatError::TransportFailure {
                    reason: format!("failed to connect to {addr}: {e}"),
                })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let keypair = DhKeyPair::generate();
        let frame = Frame::KeyExchange {
            sender: None,
            recipient: None,
            payload: KeyExchangePayload {
                public_value: keypair.public_value().clone(),
                g: keypair.generator().clone(),
                p: keypair.modulus().clone(),
            },
        };
        write_frame(&mut writer, &frame).await?;

        let reply =
            read_frame(&mut reader)
                .await?
                .ok_or_else(|| VeilchatError::TransportFailure {
                    reason: "connection closed during key exchange".into(),
                })?;

        let transport_key = match reply {
            Frame::KeyReply { payload, .. } => {
                let secret = keypair.shared_secret(&payload.public_value)?;
                derive_session_key(&secret, KeyContext::Prelogin)?
            }
            Frame::Error { payload, .. } => {
                return Err(VeilchatError::ProtocolViolation {
                    reason: payload.unwrap_or_else(|| "key exchange rejected".into()),
                });
            }
            other => {
                return Err(VeilchatError::ProtocolViolation {
                    reason: format!("expected KEY_REPLY, got {}", other.kind()),
                });
            }
        };

        tracing::debug!(%addr, "transport key established");
        Ok(Self {
            reader,
            writer,
            transport_key,
            config,
        })
    }

    /// Runs one login attempt.
    ///
    /// # Errors
    ///
    /// - [`VeilchatError::AuthenticationFailure`] when the relay
    ///   rejects the credentials (the connection stays usable for a
    ///   retry unless the relay locked the account and closed it).
    /// - [`VeilchatError::TransportFailure`] when the relay closed the
    ///   connection.
    pub async fn login(&mut self, username: &Username, password: &str) -> Result<()> {
        let credentials = Credentials::new(username.as_str(), password);
        let plaintext =
            serde_json::to_string(&credentials).map_err(|e| VeilchatError::TransportFailure {
                reason: format!("failed to serialize credentials: {e}"),
            })?;
        let sealed = seal(plaintext.as_bytes(), &self.transport_key)?;
        write_frame(&mut self.writer, &Frame::Auth { sealed }).await?;

        let response =
            read_frame(&mut self.reader)
                .await?
                .ok_or_else(|| VeilchatError::TransportFailure {
                    reason: "connection closed during login".into(),
                })?;

        match response {
            Frame::AuthResp { sealed, .. } => {
                let text = open_text(&sealed, &self.transport_key)?;
                if text == "OK" {
                    Ok(())
                } else {
                    Err(VeilchatError::AuthenticationFailure { reason: text })
                }
            }
            Frame::Error {
                sealed: Some(sealed),
                ..
            } => {
                let reason = open_text(&sealed, &self.transport_key)
                    .unwrap_or_else(|_| "login rejected".into());
                Err(VeilchatError::AuthenticationFailure { reason })
            }
            Frame::Error { payload, .. } => Err(VeilchatError::AuthenticationFailure {
                reason: payload.unwrap_or_else(|| "login rejected".into()),
            }),
            other => Err(VeilchatError::ProtocolViolation {
                reason: format!("expected AUTH_RESP, got {}", other.kind()),
            }),
        }
    }

    /// Spawns the writer task and receive loop for the authenticated
    /// session.
    pub fn start(self, username: Username) -> (Client, mpsc::UnboundedReceiver<ClientEvent>) {
        let transport_key = Arc::new(self.transport_key);
        let store = Arc::new(Mutex::new(SessionKeyStore::new()));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ClientEvent>();

        tokio::spawn(write_loop(self.writer, outbound_rx));
        tokio::spawn(recv_loop(
            self.reader,
            username.clone(),
            Arc::clone(&transport_key),
            Arc::clone(&store),
            outbound_tx.clone(),
            event_tx,
        ));

        let client = Client {
            username,
            transport_key,
            store,
            outbound: outbound_tx,
            config: self.config,
        };
        (client, event_rx)
    }
}

// ---------------------------------------------------------------------------
// Client (post-login command surface)
// ---------------------------------------------------------------------------

/// Handle for issuing commands on an authenticated session.
pub struct Client {
    username: Username,
    transport_key: Arc<SessionKey>,
    store: Arc<Mutex<SessionKeyStore>>,
    outbound: mpsc::UnboundedSender<String>,
    config: ProtocolConfig,
}

impl Client {
    /// The authenticated identity.
    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Whether a chat session key with `peer` is established.
    pub fn has_session_key(&self, peer: &Username) -> Result<bool> {
        Ok(self.lock_store()?.has_key(peer))
    }

    /// Number of chat keys currently established.
    pub fn session_key_count(&self) -> Result<usize> {
        Ok(self.lock_store()?.key_count())
    }

    /// Requests the online-user list; the response arrives as
    /// [`ClientEvent::OnlineUsers`].
    pub fn request_list(&self) -> Result<()> {
        let sealed = seal(b"LIST", &self.transport_key)?;
        self.send(&Frame::List {
            sender: self.username.to_string(),
            sealed,
        })
    }

    /// Sends an end-to-end encrypted message, establishing the chat key
    /// first if needed.
    ///
    /// # Errors
    ///
    /// - [`VeilchatError::RecipientOffline`] when the relay reports the
    ///   peer unreachable during the exchange.
    /// - [`VeilchatError::ExchangeTimeout`] when no KEY_REPLY arrives
    ///   within the configured bound.
    pub async fn send_message(&self, peer: &Username, text: &str) -> Result<()> {
        self.ensure_chat_key(peer).await?;

        let payload = self.lock_store()?.seal_for(peer, text.as_bytes())?;
        self.send(&Frame::Direct {
            sender: self.username.to_string(),
            recipient: peer.to_string(),
            payload,
        })
    }

    /// Requests logout. The relay acknowledges with a sealed notice and
    /// closes the connection.
    pub fn logout(&self) -> Result<()> {
        self.send(&Frame::Logout {
            sender: self.username.to_string(),
        })
    }

    /// Establishes the chat key with `peer` unless one already exists.
    ///
    /// Bounded wait on the exchange waiter — satisfied by the receive
    /// loop on KEY_REPLY, resolved offline on the relay's notice, or
    /// abandoned at the timeout.
    async fn ensure_chat_key(&self, peer: &Username) -> Result<()> {
        let (payload, rx) = {
            let mut store = self.lock_store()?;
            if store.has_key(peer) {
                return Ok(());
            }
            store.initiate_exchange(peer)
        };

        self.send(&Frame::KeyExchange {
            sender: Some(self.username.to_string()),
            recipient: Some(peer.to_string()),
            payload,
        })?;

        let bound = Duration::from_secs(self.config.exchange_timeout_secs);
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(ExchangeSignal::Established)) => Ok(()),
            Ok(Ok(ExchangeSignal::Offline)) => Err(VeilchatError::RecipientOffline {
                recipient: peer.to_string(),
            }),
            Ok(Err(_)) => Err(VeilchatError::TransportFailure {
                reason: "connection closed during key exchange".into(),
            }),
            Err(_) => {
                self.lock_store()?.discard_pending(peer);
                tracing::debug!(peer = %peer, "key exchange timed out");
                Err(VeilchatError::ExchangeTimeout {
                    peer: peer.to_string(),
                })
            }
        }
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let line = serde_json::to_string(frame).map_err(|e| VeilchatError::TransportFailure {
            reason: format!("frame serialization failed: {e}"),
        })?;
        self.outbound
            .send(line)
            .map_err(|_| VeilchatError::TransportFailure {
                reason: "connection writer is gone".into(),
            })
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, SessionKeyStore>> {
        self.store
            .lock()
            .map_err(|_| VeilchatError::TransportFailure {
                reason: "session key store lock poisoned".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

async fn recv_loop(
    mut reader: BufReader<OwnedReadHalf>,
    me: Username,
    transport_key: Arc<SessionKey>,
    store: Arc<Mutex<SessionKeyStore>>,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(VeilchatError::ProtocolViolation { reason }) => {
                let _ = events.send(ClientEvent::SecurityAlert(format!(
                    "dropped malformed frame: {reason}"
                )));
                continue;
            }
            Err(_) => break,
        };

        let Ok(mut guard) = store.lock() else {
            break;
        };

        match frame {
            Frame::KeyExchange {
                sender: Some(sender),
                payload,
                ..
            } => {
                let Ok(peer) = Username::new(sender) else {
                    let _ = events.send(ClientEvent::SecurityAlert(
                        "key exchange from invalid identity".into(),
                    ));
                    continue;
                };
                match guard.complete_as_responder(&peer, &payload) {
                    Ok(reply) => {
                        drop(guard);
                        let frame = Frame::KeyReply {
                            sender: me.to_string(),
                            recipient: Some(peer.to_string()),
                            payload: reply,
                        };
                        if let Ok(line) = serde_json::to_string(&frame) {
                            let _ = outbound.send(line);
                        }
                    }
                    Err(e) => {
                        let _ = events.send(ClientEvent::SecurityAlert(format!(
                            "rejected key exchange from {peer}: {e}"
                        )));
                    }
                }
            }

            Frame::KeyExchange { sender: None, .. } => {
                let _ = events.send(ClientEvent::SecurityAlert(
                    "dropped key exchange without sender".into(),
                ));
            }

            Frame::KeyReply {
                sender, payload, ..
            } => {
                let Ok(peer) = Username::new(sender) else {
                    let _ = events.send(ClientEvent::SecurityAlert(
                        "key reply from invalid identity".into(),
                    ));
                    continue;
                };
                if let Err(e) = guard.complete_as_initiator(&peer, &payload.public_value) {
                    let _ = events.send(ClientEvent::SecurityAlert(format!(
                        "rejected key reply from {peer}: {e}"
                    )));
                }
            }

            Frame::Direct {
                sender, payload, ..
            } => {
                let Ok(peer) = Username::new(sender) else {
                    let _ = events.send(ClientEvent::SecurityAlert(
                        "message from invalid identity".into(),
                    ));
                    continue;
                };
                match guard
                    .open_from(&peer, &payload)
                    .and_then(|bytes| {
                        String::from_utf8(bytes).map_err(|_| VeilchatError::ProtocolViolation {
                            reason: "message is not valid UTF-8".into(),
                        })
                    }) {
                    Ok(text) => {
                        let _ = events.send(ClientEvent::Direct { from: peer, text });
                    }
                    Err(e) => {
                        let _ = events.send(ClientEvent::SecurityAlert(format!(
                            "invalid message from {peer}: {e}"
                        )));
                    }
                }
            }

            Frame::AuthResp { sealed, .. } => match open_text(&sealed, &transport_key) {
                Ok(text) => {
                    let _ = events.send(ClientEvent::ServerNotice(text));
                }
                Err(e) => {
                    let _ = events.send(ClientEvent::SecurityAlert(format!(
                        "invalid relay acknowledgment: {e}"
                    )));
                }
            },

            Frame::List { sealed, .. } => match open_text(&sealed, &transport_key)
                .and_then(|text| {
                    serde_json::from_str::<Vec<String>>(&text).map_err(|_| {
                        VeilchatError::ProtocolViolation {
                            reason: "user list is not a JSON array".into(),
                        }
                    })
                }) {
                Ok(names) => {
                    let _ = events.send(ClientEvent::OnlineUsers(names));
                }
                Err(e) => {
                    let _ = events.send(ClientEvent::SecurityAlert(format!(
                        "invalid user list from relay: {e}"
                    )));
                }
            },

            Frame::Error {
                sealed, payload, ..
            } => {
                let text = match sealed {
                    Some(sealed) => match open_text(&sealed, &transport_key) {
                        Ok(text) => text,
                        Err(e) => {
                            let _ = events.send(ClientEvent::SecurityAlert(format!(
                                "invalid relay error notice: {e}"
                            )));
                            continue;
                        }
                    },
                    None => payload.unwrap_or_else(|| "unspecified relay error".into()),
                };

                if text.contains("Recipient offline") {
                    let resolved = guard.mark_pending_offline();
                    tracing::debug!(resolved, "relay reported recipient offline");
                }
                let _ = events.send(ClientEvent::ServerNotice(text));
            }

            Frame::Auth { .. } | Frame::Logout { .. } => {
                let _ = events.send(ClientEvent::SecurityAlert(
                    "dropped frame the relay should never send".into(),
                ));
            }
        }
    }

    let _ = events.send(ClientEvent::Closed);
}
