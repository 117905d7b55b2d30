//! Protocol-level integration tests against a live relay.
//!
//! Each test binds a relay on an ephemeral port and drives it with raw
//! frames over TCP, exercising the phase rules, authentication,
//! lockout, routing, and logout exactly as a (possibly misbehaving)
//! client would.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use veilchat_crypto::dh::DhKeyPair;
use veilchat_crypto::kdf::KdfParams;
use veilchat_protocol::codec::{open_text, seal, SealedPayload};
use veilchat_protocol::session::{derive_session_key, SessionKey};
use veilchat_protocol::transport::{read_frame, write_frame};
use veilchat_protocol::wire::{Credentials, Frame, KeyExchangePayload};
use veilchat_server::auth::AuthService;
use veilchat_server::server::Server;
use veilchat_server::users::UserStore;
use veilchat_types::config::ProtocolConfig;
use veilchat_types::{KeyContext, VeilchatError};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_users_path() -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "veilchat-relay-test-{}-{}-{}.json",
        std::process::id(),
        id,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    ))
}

/// Starts a relay with a fresh user store and light verifier KDF.
async fn start_relay(config: ProtocolConfig) -> std::result::Result<String, VeilchatError> {
    let store = UserStore::open(temp_users_path())?;
    let auth = AuthService::with_kdf(store, &config, KdfParams { iterations: 500 });
    let server = Server::bind_with("127.0.0.1:0", auth, config).await?;
    let addr = server.local_addr()?.to_string();
    tokio::spawn(server.run());
    Ok(addr)
}

struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    key: SessionKey,
}

impl RawClient {
    /// Connects and completes the transport key exchange.
    async fn connect(addr: &str) -> std::result::Result<Self, VeilchatError> {
        let stream =
            TcpStream::connect(addr)
                .await
                .map_err(|e| VeilchatError::TransportFailure {
                    reason: format!("connect failed: {e}"),
                })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let keypair = DhKeyPair::generate();
        write_frame(
            &mut writer,
            &Frame::KeyExchange {
                sender: None,
                recipient: None,
                payload: KeyExchangePayload {
                    public_value: keypair.public_value().clone(),
                    g: keypair.generator().clone(),
                    p: keypair.modulus().clone(),
                },
            },
        )
        .await?;

        let reply = read_frame(&mut reader)
            .await?
            .ok_or_else(|| VeilchatError::TransportFailure {
                reason: "closed during handshake".into(),
            })?;
        let Frame::KeyReply { payload, .. } = reply else {
            return Err(VeilchatError::ProtocolViolation {
                reason: "expected KEY_REPLY".into(),
            });
        };

        let secret = keypair.shared_secret(&payload.public_value)?;
        let key = derive_session_key(&secret, KeyContext::Prelogin)?;
        Ok(Self {
            reader,
            writer,
            key,
        })
    }

    async fn send(&mut self, frame: &Frame) -> std::result::Result<(), VeilchatError> {
        write_frame(&mut self.writer, frame).await
    }

    async fn recv(&mut self) -> std::result::Result<Option<Frame>, VeilchatError> {
        read_frame(&mut self.reader).await
    }

    fn seal(&self, plaintext: &[u8]) -> std::result::Result<SealedPayload, VeilchatError> {
        seal(plaintext, &self.key)
    }

    fn open(&self, sealed: &SealedPayload) -> std::result::Result<String, VeilchatError> {
        open_text(sealed, &self.key)
    }

    /// One AUTH attempt; returns the decrypted response text.
    async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> std::result::Result<String, VeilchatError> {
        let plaintext = serde_json::to_string(&Credentials::new(username, password))
            .map_err(|e| VeilchatError::TransportFailure {
                reason: format!("serialize failed: {e}"),
            })?;
        let sealed = self.seal(plaintext.as_bytes())?;
        self.send(&Frame::Auth { sealed }).await?;

        let response = self
            .recv()
            .await?
            .ok_or_else(|| VeilchatError::TransportFailure {
                reason: "closed during login".into(),
            })?;
        match response {
            Frame::AuthResp { sealed, .. } | Frame::Error {
                sealed: Some(sealed),
                ..
            } => self.open(&sealed),
            Frame::Error { payload, .. } => {
                Ok(payload.unwrap_or_else(|| "unsealed error".into()))
            }
            other => Err(VeilchatError::ProtocolViolation {
                reason: format!("unexpected {}", other.kind()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_frame_must_be_key_exchange() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    let stream = TcpStream::connect(&addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    // LOGOUT before any key exchange is a fatal violation.
    write_frame(
        &mut writer,
        &Frame::Logout {
            sender: "alice".into(),
        },
    )
    .await?;

    let response = read_frame(&mut reader).await?.expect("error frame");
    match response {
        Frame::Error { payload, .. } => {
            assert_eq!(payload.as_deref(), Some("Expected key exchange"));
        }
        other => panic!("expected ERROR, got {}", other.kind()),
    }

    // The relay closes the connection.
    assert!(read_frame(&mut reader).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn non_auth_frame_before_login_is_rejected_but_recoverable() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;
    let mut client = RawClient::connect(&addr).await?;

    // LIST before AUTH: answered with an error, connection stays open.
    let sealed = client.seal(b"LIST")?;
    client
        .send(&Frame::List {
            sender: "alice".into(),
            sealed,
        })
        .await?;

    let response = client.recv().await?.expect("error frame");
    match response {
        Frame::Error {
            sealed: Some(sealed),
            ..
        } => {
            assert_eq!(client.open(&sealed)?, "Expected AUTH");
        }
        other => panic!("expected sealed ERROR, got {}", other.kind()),
    }

    // Login still works afterwards.
    assert_eq!(client.login("alice", "p1").await?, "OK");
    Ok(())
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_then_wrong_then_correct_password() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    // First login registers.
    let mut alice = RawClient::connect(&addr).await?;
    assert_eq!(alice.login("alice", "p1").await?, "OK");
    drop(alice);

    // Wrong password rejected, correct accepted on the same connection.
    let mut retry = RawClient::connect(&addr).await?;
    assert_eq!(retry.login("alice", "p2").await?, "Incorrect password");
    assert_eq!(retry.login("alice", "p1").await?, "OK");
    Ok(())
}

#[tokio::test]
async fn lockout_refuses_correct_password() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    let mut first = RawClient::connect(&addr).await?;
    assert_eq!(first.login("alice", "p1").await?, "OK");
    drop(first);

    // Four wrong attempts on one connection...
    let mut attacker = RawClient::connect(&addr).await?;
    for _ in 0..4 {
        assert_eq!(attacker.login("alice", "nope").await?, "Incorrect password");
    }
    // ...the fifth trips the lockout and the relay closes.
    let notice = attacker.login("alice", "nope").await?;
    assert!(notice.contains("Too many login attempts"));
    assert!(attacker.recv().await?.is_none());

    // Even the correct password is refused inside the window.
    let mut honest = RawClient::connect(&addr).await?;
    let notice = honest.login("alice", "p1").await?;
    assert!(notice.contains("Too many login attempts"));
    Ok(())
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_to_offline_recipient_yields_offline_error() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    let mut alice = RawClient::connect(&addr).await?;
    assert_eq!(alice.login("alice", "p1").await?, "OK");

    // The payload is opaque to the relay; any sealed blob will do.
    let payload = alice.seal(b"hi")?;
    alice
        .send(&Frame::Direct {
            sender: "alice".into(),
            recipient: "bob".into(),
            payload,
        })
        .await?;

    let response = alice.recv().await?.expect("error frame");
    match response {
        Frame::Error {
            sealed: Some(sealed),
            ..
        } => {
            assert_eq!(alice.open(&sealed)?, "Recipient offline");
        }
        other => panic!("expected sealed ERROR, got {}", other.kind()),
    }
    Ok(())
}

#[tokio::test]
async fn list_reports_online_users_sorted() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    let mut bob = RawClient::connect(&addr).await?;
    assert_eq!(bob.login("bob", "pb").await?, "OK");
    let mut alice = RawClient::connect(&addr).await?;
    assert_eq!(alice.login("alice", "pa").await?, "OK");

    let sealed = alice.seal(b"LIST")?;
    alice
        .send(&Frame::List {
            sender: "alice".into(),
            sealed,
        })
        .await?;

    let response = alice.recv().await?.expect("list frame");
    match response {
        Frame::List { sealed, sender } => {
            assert_eq!(sender, "server");
            let listing = alice.open(&sealed)?;
            let names: Vec<String> = serde_json::from_str(&listing)?;
            assert_eq!(names, vec!["alice", "bob"]);
        }
        other => panic!("expected LIST, got {}", other.kind()),
    }
    Ok(())
}

#[tokio::test]
async fn spoofed_sender_is_not_forwarded() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    let mut bob = RawClient::connect(&addr).await?;
    assert_eq!(bob.login("bob", "pb").await?, "OK");
    let mut mallory = RawClient::connect(&addr).await?;
    assert_eq!(mallory.login("mallory", "pm").await?, "OK");

    // Mallory claims to be alice.
    let payload = mallory.seal(b"hi bob")?;
    mallory
        .send(&Frame::Direct {
            sender: "alice".into(),
            recipient: "bob".into(),
            payload,
        })
        .await?;

    let response = mallory.recv().await?.expect("error frame");
    match response {
        Frame::Error {
            sealed: Some(sealed),
            ..
        } => {
            assert_eq!(mallory.open(&sealed)?, "Sender identity mismatch");
        }
        other => panic!("expected sealed ERROR, got {}", other.kind()),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Logout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn logout_is_acknowledged_then_closed() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    let mut alice = RawClient::connect(&addr).await?;
    assert_eq!(alice.login("alice", "p1").await?, "OK");

    alice
        .send(&Frame::Logout {
            sender: "alice".into(),
        })
        .await?;

    let response = alice.recv().await?.expect("acknowledgment");
    match response {
        Frame::AuthResp { sealed, .. } => {
            assert_eq!(alice.open(&sealed)?, "Logged out.");
        }
        other => panic!("expected AUTH_RESP, got {}", other.kind()),
    }
    assert!(alice.recv().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn disconnect_frees_the_username() -> TestResult {
    let addr = start_relay(ProtocolConfig::default()).await?;

    let mut alice = RawClient::connect(&addr).await?;
    assert_eq!(alice.login("alice", "p1").await?, "OK");
    drop(alice);

    // Give the relay a moment to observe the disconnect.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut bob = RawClient::connect(&addr).await?;
    assert_eq!(bob.login("bob", "pb").await?, "OK");

    let sealed = bob.seal(b"LIST")?;
    bob.send(&Frame::List {
        sender: "bob".into(),
        sealed,
    })
    .await?;

    match bob.recv().await?.expect("list frame") {
        Frame::List { sealed, .. } => {
            let names: Vec<String> = serde_json::from_str(&bob.open(&sealed)?)?;
            assert_eq!(names, vec!["bob"]);
        }
        other => panic!("expected LIST, got {}", other.kind()),
    }
    Ok(())
}
