//! Veilchat relay server binary.
//!
//! Usage:
//!
//!   veilchat-server [OPTIONS]
//!
//! Options:
//!
//!   --host <HOST>        Bind address (default: 127.0.0.1)
//!   --port <PORT>        Bind port (default: 7878)
//!   --users-file <PATH>  User store path (default: ./users.json)
//!   --config <PATH>      Load config from JSON file
//!
//! The server runs until interrupted with Ctrl+C.

use veilchat_server::config::{CliArgs, ServerConfig};
use veilchat_server::server::Server;

#[tokio::main]
async fn main() {
    // Tracing / logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Parse CLI arguments.
    let cli = CliArgs::parse_from_env();

    // Load or merge config file if provided.
    let config = match &cli.config_path {
        Some(path) => match ServerConfig::load(path) {
            Ok(cfg) => cfg.merge_cli(&cli),
            Err(e) => {
                tracing::error!("failed to load config file: {e}");
                std::process::exit(1);
            }
        },
        None => ServerConfig::from_cli(&cli),
    };

    if let Err(e) = run(config).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), String> {
    let addr = config.bind_addr();

    let server = Server::bind(&addr, &config.users_file, config.protocol.clone())
        .await
        .map_err(|e| format!("failed to start server: {e}"))?;

    let local = server
        .local_addr()
        .map_err(|e| format!("failed to read bind address: {e}"))?;

    tracing::info!(%local, users_file = %config.users_file.display(), "relay listening");

    println!();
    println!("============================================================");
    println!("  Veilchat Relay running");
    println!("============================================================");
    println!("  Listen:     {local}");
    println!("  User store: {}", config.users_file.display());
    println!(
        "  Lockout:    {} failures / {}s window",
        config.protocol.max_login_attempts, config.protocol.login_window_secs
    );
    println!("============================================================");
    println!("  Press Ctrl+C to stop");
    println!("============================================================");
    println!();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down...");
            Ok(())
        }
        result = server.run() => {
            match result {
                Ok(()) => Err("accept loop exited unexpectedly".into()),
                Err(e) => Err(format!("accept loop failed: {e}")),
            }
        }
    }
}
