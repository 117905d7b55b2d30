//! Listener setup and accept loop.
//!
//! One tokio task per accepted connection; all tasks share one
//! [`ServerState`] holding the router, the authentication service, and
//! the protocol configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;

use veilchat_types::config::ProtocolConfig;
use veilchat_types::{Result, VeilchatError};

use crate::auth::AuthService;
use crate::handler;
use crate::router::Router;
use crate::users::UserStore;

// ---------------------------------------------------------------------------
// ServerState
// ---------------------------------------------------------------------------

/// State shared by all connection tasks.
pub struct ServerState {
    /// Identity → connection table.
    pub router: Router,
    /// Verifier checks and login throttling.
    pub auth: AuthService,
    /// Protocol tunables.
    pub config: ProtocolConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A bound relay server, ready to accept connections.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds to `addr` with a user store at `users_file`.
    pub async fn bind(addr: &str, users_file: &Path, config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        let store = UserStore::open(users_file)?;
        let auth = AuthService::new(store, &config);
        Self::bind_with(addr, auth, config).await
    }

    /// Binds with a caller-constructed [`AuthService`] (tests use this
    /// to inject lighter KDF parameters).
    pub async fn bind_with(addr: &str, auth: AuthService, config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        let listener =
            TcpListener::bind(addr)
                .await
                .map_err(|e| VeilchatError::TransportFailure {
                    reason: format!("failed to bind {addr}: {e}"),
                })?;

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                router: Router::new(),
                auth,
                config,
            }),
        })
    }

    /// The address the listener is bound to (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| VeilchatError::TransportFailure {
                reason: format!("failed to read local address: {e}"),
            })
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, addr) =
                self.listener
                    .accept()
                    .await
                    .map_err(|e| VeilchatError::TransportFailure {
                        reason: format!("accept failed: {e}"),
                    })?;
            tracing::debug!(%addr, "accepted");
            tokio::spawn(handler::handle_connection(stream, Arc::clone(&self.state)));
        }
    }
}
