//! CLI argument parsing and config file support for the relay binary.
//!
//! The server can be configured via CLI flags, a JSON config file, or a
//! combination of both (CLI overrides config file).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use veilchat_types::config::ProtocolConfig;

// ---------------------------------------------------------------------------
// CLI arguments (manual parsing, no clap dependency)
// ---------------------------------------------------------------------------

/// Parsed command-line arguments.
pub struct CliArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub users_file: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

impl CliArgs {
    /// Parses CLI arguments from `std::env::args`.
    pub fn parse_from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut cli = Self {
            host: None,
            port: None,
            users_file: None,
            config_path: None,
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" => {
                    i += 1;
                    cli.host = args.get(i).cloned();
                }
                "--port" => {
                    i += 1;
                    cli.port = args.get(i).and_then(|s| s.parse().ok());
                }
                "--users-file" => {
                    i += 1;
                    cli.users_file = args.get(i).map(PathBuf::from);
                }
                "--config" => {
                    i += 1;
                    cli.config_path = args.get(i).map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {other}");
                    eprintln!("use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        cli
    }
}

// ---------------------------------------------------------------------------
// Config file (JSON)
// ---------------------------------------------------------------------------

/// JSON config file format.
///
/// Example `relay.json`:
/// ```json
/// {
///   "host": "0.0.0.0",
///   "port": 7878,
///   "users_file": "/var/lib/veilchat/users.json",
///   "max_login_attempts": 5,
///   "login_window_secs": 60
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfigFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub users_file: Option<String>,
    pub max_login_attempts: Option<u32>,
    pub login_window_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults applied)
// ---------------------------------------------------------------------------

/// Fully resolved server configuration with all defaults applied.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub users_file: PathBuf,
    pub protocol: ProtocolConfig,
}

impl ServerConfig {
    /// Build config purely from CLI args with defaults.
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            host: cli.host.clone().unwrap_or_else(|| "127.0.0.1".into()),
            port: cli.port.unwrap_or(7878),
            users_file: cli
                .users_file
                .clone()
                .unwrap_or_else(|| PathBuf::from("users.json")),
            protocol: ProtocolConfig::default(),
        }
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {e}"))?;

        let file: ServerConfigFile =
            serde_json::from_str(&text).map_err(|e| format!("invalid config JSON: {e}"))?;

        let mut protocol = ProtocolConfig::default();
        if let Some(max) = file.max_login_attempts {
            protocol.max_login_attempts = max;
        }
        if let Some(window) = file.login_window_secs {
            protocol.login_window_secs = window;
        }

        Ok(Self {
            host: file.host.unwrap_or_else(|| "127.0.0.1".into()),
            port: file.port.unwrap_or(7878),
            users_file: file
                .users_file
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("users.json")),
            protocol,
        })
    }

    /// Merge CLI overrides onto a config-file base.
    pub fn merge_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(ref host) = cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(ref path) = cli.users_file {
            self.users_file = path.clone();
        }
        self
    }

    /// The `host:port` string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"Veilchat Relay Server

USAGE:
    veilchat-server [OPTIONS]

OPTIONS:
    --host <HOST>         Bind address (default: 127.0.0.1)
    --port <PORT>         Bind port (default: 7878)
    --users-file <PATH>   User store path (default: ./users.json)
    --config <PATH>       Load settings from JSON config file
    -h, --help            Show this help

EXAMPLES:
    # Local development relay
    veilchat-server --port 7878

    # Public relay with a persistent user store
    veilchat-server --host 0.0.0.0 --users-file /var/lib/veilchat/users.json

    # Use config file
    veilchat-server --config /etc/veilchat/relay.json

ENVIRONMENT:
    RUST_LOG              Log level filter (default: info)
"#
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
