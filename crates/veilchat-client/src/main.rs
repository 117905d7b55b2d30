//! Veilchat interactive chat client.
//!
//! Connects to a relay, authenticates, then enters a read-eval-print
//! loop:
//!
//!   list                 Show online users
//!   send <user> <text>   Send an end-to-end encrypted message
//!   logout               Log out and exit
//!
//! # Graceful shutdown
//!
//! Handles `SIGINT` (Ctrl+C) via `tokio::signal::ctrl_c`. The loop
//! exits cleanly without panic.

use clap::Parser;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use veilchat_client::connection::{Client, ClientEvent, Connection};
use veilchat_types::config::ProtocolConfig;
use veilchat_types::{Username, VeilchatError};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Veilchat — end-to-end encrypted chat over a relay.
#[derive(Parser)]
#[command(name = "veilchat", version, about)]
struct Cli {
    /// Relay address to connect to.
    #[arg(long, default_value = "127.0.0.1:7878")]
    server: String,

    /// Username (prompted when omitted).
    #[arg(long)]
    username: Option<String>,

    /// Seconds to wait for a peer's key-exchange reply.
    #[arg(long, default_value = "5")]
    exchange_timeout: u64,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "error:".red());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = ProtocolConfig {
        exchange_timeout_secs: cli.exchange_timeout,
        ..Default::default()
    };

    let mut connection = Connection::establish(&cli.server, config.clone())
        .await
        .map_err(|e| format!("failed to reach relay at {}: {e}", cli.server))?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    // Login, with a bounded number of prompts. The relay enforces its
    // own lockout independently.
    let mut logged_in: Option<Username> = None;
    for attempt in 0..config.client_max_retries {
        let name = match (&cli.username, attempt) {
            (Some(name), 0) => name.clone(),
            _ => prompt(&mut lines, "Username: ").await?,
        };
        let username = match Username::new(name) {
            Ok(u) => u,
            Err(e) => {
                println!("{} {e}", "Login failed:".red());
                continue;
            }
        };
        let password = read_password(&mut lines).await?;

        match connection.login(&username, &password).await {
            Ok(()) => {
                logged_in = Some(username);
                break;
            }
            Err(VeilchatError::AuthenticationFailure { reason }) => {
                println!("{} {reason}", "Login failed:".red());
            }
            Err(e) => return Err(format!("login failed: {e}")),
        }
    }

    let Some(username) = logged_in else {
        return Err("too many failed login attempts".into());
    };

    println!(
        "{} {}",
        "Logged in as".green(),
        username.as_str().bold()
    );
    println!(
        "Commands: {} {} {}",
        "list".bold(),
        "send <user> <message>".bold(),
        "logout".bold(),
    );
    println!();

    let (client, mut events) = connection.start(username);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if handle_command(&client, line.trim()).await == Flow::Quit {
                            drain_until_closed(&mut events).await;
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = client.logout();
                        break;
                    }
                    Err(e) => {
                        eprintln!("failed to read input: {e}");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(ClientEvent::Closed) | None => {
                        println!("{}", "Disconnected from relay.".dimmed());
                        break;
                    }
                    Some(event) => print_event(event),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = client.logout();
                println!("\n{}", "Logging out.".dimmed());
            }
        }
    }

    Ok(())
}

/// After a logout, prints remaining events (the relay's acknowledgment)
/// until the connection closes, bounded so a stalled relay cannot hang
/// the exit.
async fn drain_until_closed(events: &mut tokio::sync::mpsc::UnboundedReceiver<ClientEvent>) {
    let drain = async {
        while let Some(event) = events.recv().await {
            if matches!(event, ClientEvent::Closed) {
                break;
            }
            print_event(event);
        }
    };
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), drain).await;
    println!("{}", "Disconnected from relay.".dimmed());
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Eq, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

async fn handle_command(client: &Client, input: &str) -> Flow {
    if input.is_empty() {
        return Flow::Continue;
    }

    let (command, rest) = match input.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (input, ""),
    };

    match command.to_ascii_lowercase().as_str() {
        "list" => {
            if let Err(e) = client.request_list() {
                eprintln!("{} {e}", "ERROR:".red());
            }
        }
        "logout" => {
            if let Err(e) = client.logout() {
                eprintln!("{} {e}", "ERROR:".red());
                return Flow::Quit;
            }
            println!("{}", format!("Logging off as {}", client.username()).dimmed());
            return Flow::Quit;
        }
        "send" => {
            let Some((target, text)) = rest.split_once(' ') else {
                println!("Usage: send <user> <message>");
                return Flow::Continue;
            };
            let peer = match Username::new(target) {
                Ok(u) => u,
                Err(e) => {
                    println!("{} {e}", "ERROR:".red());
                    return Flow::Continue;
                }
            };
            match client.send_message(&peer, text.trim()).await {
                Ok(()) => {}
                Err(VeilchatError::RecipientOffline { recipient }) => {
                    println!("{} {recipient} is offline", "ERROR:".red());
                }
                Err(VeilchatError::ExchangeTimeout { peer }) => {
                    println!(
                        "{} failed to establish session with {peer}",
                        "TIMEOUT:".red()
                    );
                }
                Err(e) => {
                    eprintln!("{} {e}", "ERROR:".red());
                }
            }
        }
        _ => {
            println!("Unknown command. Try: list, send <user> <message>, logout");
        }
    }

    Flow::Continue
}

// ---------------------------------------------------------------------------
// Event rendering
// ---------------------------------------------------------------------------

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::Direct { from, text } => {
            println!("{} {text}", format!("[{from}]:").cyan().bold());
        }
        ClientEvent::OnlineUsers(names) => {
            println!("{} {}", "Online users:".green(), names.join(", "));
        }
        ClientEvent::ServerNotice(text) => {
            println!("{} {text}", "[relay]".dimmed());
        }
        ClientEvent::SecurityAlert(text) => {
            eprintln!("{} {text}", "SECURITY:".red().bold());
        }
        ClientEvent::Closed => {}
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, label: &str) -> Result<String, String> {
    eprint!("{label}");
    match lines.next_line().await {
        Ok(Some(line)) => Ok(line.trim().to_string()),
        Ok(None) => Err("stdin closed".into()),
        Err(e) => Err(format!("failed to read input: {e}")),
    }
}

/// Reads the password from `VEILCHAT_PASSWORD` (for non-interactive
/// usage) or an interactive prompt.
async fn read_password(lines: &mut Lines<BufReader<Stdin>>) -> Result<String, String> {
    if let Ok(password) = std::env::var("VEILCHAT_PASSWORD") {
        return Ok(password);
    }
    prompt(lines, "Password: ").await
}
