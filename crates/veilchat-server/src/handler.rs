//! Per-connection protocol task.
//!
//! Every accepted socket gets one task running [`handle_connection`]
//! plus a writer task draining the connection's outbound channel.
//! Forwarded frames from other connections and the handler's own
//! responses share that channel, so all writes are serialized.
//!
//! Phase handling follows the protocol state machine: the first frame
//! must be the transport KEY_EXCHANGE, the next an AUTH sealed under
//! the derived transport key. Only then do LIST / MESSAGE /
//! KEY_EXCHANGE / KEY_REPLY / LOGOUT flow.
//!
//! Whatever ends the connection — logout, lockout, EOF, transport
//! error — the cleanup path unregisters the router entry and drops the
//! transport key.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use veilchat_crypto::dh::{self, DhKeyPair};
use veilchat_protocol::codec::{open, open_text, seal, SealedPayload};
use veilchat_protocol::session::{derive_session_key, SessionKey};
use veilchat_protocol::state::ProtocolState;
use veilchat_protocol::transport::read_frame_raw;
use veilchat_protocol::wire::{Credentials, Frame, KeyExchangePayload, KeyReplyPayload};
use veilchat_types::{KeyContext, Result, Username, VeilchatError, SERVER_SENDER};

use crate::auth::AuthOutcome;
use crate::router::ConnectionId;
use crate::server::ServerState;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Runs one connection to completion and releases its resources.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let conn_id = ConnectionId::next();
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    tracing::info!(%conn_id, %peer, "new connection");

    let (read_half, write_half) = stream.into_split();
    let reader = BufReader::new(read_half);

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_loop(write_half, rx));

    if let Err(e) = drive(reader, &tx, conn_id, &state).await {
        tracing::debug!(%conn_id, error = %e, "connection ended with error");
    }

    if let Err(e) = state.router.unregister(conn_id) {
        tracing::warn!(%conn_id, error = %e, "failed to unregister connection");
    }

    // Dropping the last sender lets the writer drain and exit.
    drop(tx);
    let _ = writer_task.await;
    tracing::info!(%conn_id, %peer, "disconnected");
}

/// Drains the outbound channel onto the socket.
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
// Protocol loop
// ---------------------------------------------------------------------------

async fn drive(
    mut reader: BufReader<OwnedReadHalf>,
    tx: &mpsc::UnboundedSender<String>,
    conn_id: ConnectionId,
    state: &ServerState,
) -> Result<()> {
    let mut protocol = ProtocolState::new();
    let mut transport_key: Option<SessionKey> = None;
    let mut username: Option<Username> = None;

    loop {
        let (frame, raw) = match read_frame_raw(&mut reader).await {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(VeilchatError::ProtocolViolation { reason }) => {
                // Unparseable frame. Without a transport key there is
                // nothing worth keeping the socket open for.
                match transport_key.as_ref() {
                    Some(key) => {
                        send_sealed_error(tx, key, &reason)?;
                        continue;
                    }
                    None => {
                        send_plain_error(tx, &reason)?;
                        break;
                    }
                }
            }
            Err(e) => return Err(e),
        };

        if let Err(violation) = protocol.accept(frame.kind()) {
            if violation.fatal {
                send_plain_error(tx, &violation.reason)?;
                break;
            }
            match transport_key.as_ref() {
                Some(key) => send_sealed_error(tx, key, &violation.reason)?,
                None => send_plain_error(tx, &violation.reason)?,
            }
            continue;
        }

        match frame {
            // First exchange on the connection: the transport key.
            Frame::KeyExchange { payload, .. } if transport_key.is_none() => {
                match establish_transport_key(&payload) {
                    Ok((key, reply)) => {
                        transport_key = Some(key);
                        send_frame(
                            tx,
                            &Frame::KeyReply {
                                sender: SERVER_SENDER.into(),
                                recipient: None,
                                payload: reply,
                            },
                        )?;
                        tracing::debug!(%conn_id, "transport key established");
                    }
                    Err(e) => {
                        tracing::warn!(%conn_id, error = %e, "transport key exchange rejected");
                        send_plain_error(tx, "Key exchange failed")?;
                        break;
                    }
                }
            }

            Frame::Auth { sealed } => {
                let Some(key) = transport_key.as_ref() else {
                    break;
                };
                match handle_auth(&sealed, key, tx, conn_id, state, &mut protocol)? {
                    AuthStep::LoggedIn(name) => username = Some(name),
                    AuthStep::Retry => {}
                    AuthStep::Terminate => break,
                }
            }

            Frame::List { sealed, .. } => {
                let Some(key) = transport_key.as_ref() else {
                    break;
                };
                if let Err(e) = open(&sealed, key) {
                    tracing::warn!(%conn_id, error = %e, "dropping LIST with bad integrity");
                    continue;
                }
                let names = state.router.list_online()?;
                let listing =
                    serde_json::to_string(&names).map_err(|e| VeilchatError::TransportFailure {
                        reason: format!("failed to serialize user list: {e}"),
                    })?;
                let sealed = seal(listing.as_bytes(), key)?;
                send_frame(tx, &Frame::list(SERVER_SENDER, sealed))?;
            }

            Frame::Direct {
                sender, recipient, ..
            } => {
                relay(
                    state,
                    tx,
                    &transport_key,
                    &username,
                    Some(sender),
                    Some(recipient),
                    raw,
                )?;
            }

            Frame::KeyExchange {
                sender, recipient, ..
            } => {
                relay(state, tx, &transport_key, &username, sender, recipient, raw)?;
            }

            Frame::KeyReply {
                sender, recipient, ..
            } => {
                relay(
                    state,
                    tx,
                    &transport_key,
                    &username,
                    Some(sender),
                    recipient,
                    raw,
                )?;
            }

            Frame::Logout { .. } => {
                let Some(key) = transport_key.as_ref() else {
                    break;
                };
                let sealed = seal(b"Logged out.", key)?;
                send_frame(tx, &Frame::auth_resp(SERVER_SENDER, sealed))?;
                if let Some(name) = &username {
                    tracing::info!(%conn_id, user = %name, "logout");
                }
                break;
            }

            // The state machine rejects these before dispatch.
            Frame::AuthResp { .. } | Frame::Error { .. } => {
                tracing::debug!(%conn_id, "ignoring unexpected frame");
            }
        }
    }

    protocol.close();
    Ok(())
}

// ---------------------------------------------------------------------------
// Transport key establishment
// ---------------------------------------------------------------------------

/// Validates the initiator's parameters, runs the responder half of the
/// exchange, and derives the prelogin session key.
fn establish_transport_key(
    payload: &KeyExchangePayload,
) -> Result<(SessionKey, KeyReplyPayload)> {
    dh::validate_group(&payload.g, &payload.p)?;
    dh::validate_public_value(&payload.public_value, &payload.p)?;

    let keypair = DhKeyPair::generate_in(payload.g.clone(), payload.p.clone());
    let secret = keypair.shared_secret(&payload.public_value)?;
    let key = derive_session_key(&secret, KeyContext::Prelogin)?;

    Ok((
        key,
        KeyReplyPayload {
            public_value: keypair.public_value().clone(),
        },
    ))
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

enum AuthStep {
    LoggedIn(Username),
    Retry,
    Terminate,
}

fn handle_auth(
    sealed: &SealedPayload,
    key: &SessionKey,
    tx: &mpsc::UnboundedSender<String>,
    conn_id: ConnectionId,
    state: &ServerState,
    protocol: &mut ProtocolState,
) -> Result<AuthStep> {
    let plaintext = match open_text(sealed, key) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(%conn_id, error = %e, "AUTH envelope failed verification");
            protocol.auth_resolved(false);
            send_sealed_error(tx, key, "HMAC verification failed")?;
            return Ok(AuthStep::Retry);
        }
    };

    let credentials: Credentials = match serde_json::from_str(&plaintext) {
        Ok(c) => c,
        Err(_) => {
            protocol.auth_resolved(false);
            send_sealed_error(tx, key, "Malformed credentials")?;
            return Ok(AuthStep::Retry);
        }
    };

    let username = match Username::new(credentials.sender) {
        Ok(u) => u,
        Err(e) => {
            protocol.auth_resolved(false);
            send_sealed_error(tx, key, &e.to_string())?;
            return Ok(AuthStep::Retry);
        }
    };

    match state
        .auth
        .authenticate(&username, &credentials.payload.password)?
    {
        AuthOutcome::Accepted => {
            state
                .router
                .register(username.clone(), conn_id, tx.clone())?;
            protocol.auth_resolved(true);
            let sealed = seal(b"OK", key)?;
            send_frame(
                tx,
                &Frame::AuthResp {
                    sender: SERVER_SENDER.into(),
                    sealed,
                },
            )?;
            tracing::info!(%conn_id, user = %username, "authenticated");
            Ok(AuthStep::LoggedIn(username))
        }
        AuthOutcome::Rejected => {
            protocol.auth_resolved(false);
            send_sealed_error(tx, key, "Incorrect password")?;
            Ok(AuthStep::Retry)
        }
        AuthOutcome::LockedOut => {
            tracing::warn!(%conn_id, user = %username, "login lockout, closing connection");
            protocol.auth_resolved(false);
            send_sealed_error(tx, key, "Too many login attempts. Try again later.")?;
            Ok(AuthStep::Terminate)
        }
    }
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

/// Relays a raw peer-to-peer frame to its recipient.
///
/// The claimed sender must match the authenticated identity — the relay
/// refuses to deliver frames that would let one user impersonate
/// another. An unreachable recipient yields the sealed
/// "Recipient offline" notice; the sender's session state is untouched.
fn relay(
    state: &ServerState,
    tx: &mpsc::UnboundedSender<String>,
    transport_key: &Option<SessionKey>,
    username: &Option<Username>,
    claimed_sender: Option<String>,
    recipient: Option<String>,
    raw: String,
) -> Result<()> {
    let Some(key) = transport_key.as_ref() else {
        return Ok(());
    };
    let Some(me) = username.as_ref() else {
        return Ok(());
    };

    let Some(recipient) = recipient else {
        send_sealed_error(tx, key, "Missing recipient")?;
        return Ok(());
    };

    if claimed_sender.as_deref() != Some(me.as_str()) {
        tracing::warn!(user = %me, claimed = ?claimed_sender, "sender identity mismatch");
        send_sealed_error(tx, key, "Sender identity mismatch")?;
        return Ok(());
    }

    let recipient = match Username::new(recipient) {
        Ok(u) => u,
        Err(_) => {
            send_offline_notice(tx, key)?;
            return Ok(());
        }
    };

    match state.router.forward(&recipient, raw) {
        Ok(()) => Ok(()),
        Err(VeilchatError::RecipientOffline { .. }) => send_offline_notice(tx, key),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &Frame) -> Result<()> {
    let line = serde_json::to_string(frame).map_err(|e| VeilchatError::TransportFailure {
        reason: format!("frame serialization failed: {e}"),
    })?;
    tx.send(line).map_err(|_| VeilchatError::TransportFailure {
        reason: "connection writer is gone".into(),
    })
}

/// Plaintext ERROR for the pre-key phase, where no transport key exists
/// to seal under.
fn send_plain_error(tx: &mpsc::UnboundedSender<String>, reason: &str) -> Result<()> {
    send_frame(
        tx,
        &Frame::Error {
            sender: Some(SERVER_SENDER.into()),
            payload: Some(reason.to_string()),
            sealed: None,
        },
    )
}

fn send_sealed_error(
    tx: &mpsc::UnboundedSender<String>,
    key: &SessionKey,
    reason: &str,
) -> Result<()> {
    let sealed = seal(reason.as_bytes(), key)?;
    send_frame(
        tx,
        &Frame::Error {
            sender: Some(SERVER_SENDER.into()),
            payload: None,
            sealed: Some(sealed),
        },
    )
}

fn send_offline_notice(tx: &mpsc::UnboundedSender<String>, key: &SessionKey) -> Result<()> {
    send_sealed_error(tx, key, "Recipient offline")
}
