//! `MeshChat`: line-mode chat over a local broadcast segment.
//!
//! Every line typed on stdin is flooded to the neighborhood. Lines starting
//! with `/` are commands:
//!
//! - `/peers`   show the current directory
//! - `/history` show every message seen so far
//! - `/quit`    leave
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/meshchat/config.toml`).
//!
//! ```bash
//! cargo run --bin meshchat -- --name alice
//!
//! # Or via environment variables
//! MESHCHAT_NAME=bob MESHCHAT_PORT=47801 cargo run
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use meshchat::config::{CliArgs, ClientConfig, ConfigError};
use meshchat::engine::EngineEvent;
use meshchat::node::{self, NodeHandle};
use meshchat::transport::udp::UdpTransport;
use meshchat_proto::message::{MessageKind, PeerId};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > config file > env > defaults).
    // An unusable file is skipped; bad flags are fatal.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e @ (ConfigError::ReadFile { .. } | ConfigError::ParseToml(_))) => {
            eprintln!("Warning: ignoring config file: {e}");
            ClientConfig::from_cli(&cli).map_err(io::Error::other)?
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return Err(io::Error::other(e));
        }
    };

    // Logs go to a file so they don't interleave with the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let local_id = PeerId::new(config.name.clone().unwrap_or_else(default_name));
    tracing::info!(peer = %local_id, port = config.port, "meshchat starting");

    let transport = UdpTransport::bind(local_id.clone(), config.to_udp_config())
        .await
        .map_err(io::Error::other)?;
    let (handle, events) = node::spawn_node(
        local_id.clone(),
        Arc::new(transport),
        config.to_engine_config(),
        config.channel_capacity,
    );

    println!("[{}] joined as {local_id}. Type /quit to leave.", now());
    run_console(&handle, events).await?;

    handle.shutdown().await;
    tracing::info!("meshchat exiting");
    Ok(())
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("meshchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Fallback identity when no name is configured.
fn default_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

/// Read stdin and print engine events until `/quit` or end of input.
async fn run_console(
    handle: &NodeHandle,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !handle_line(handle, line).await {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
        }
    }
    Ok(())
}

/// Act on one input line. Returns `false` when the user asked to leave.
async fn handle_line(handle: &NodeHandle, line: &str) -> bool {
    match line {
        "/quit" => return false,
        "/peers" => match handle.peers().await {
            Ok(peers) if peers.is_empty() => println!("[{}] nobody is connected", now()),
            Ok(peers) => {
                let names: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
                println!("[{}] peers: {}", now(), names.join(", "));
            }
            Err(e) => println!("[{}] {e}", now()),
        },
        "/history" => match handle.history().await {
            Ok(history) => {
                for message in history.iter().filter(|m| m.kind == MessageKind::Chat) {
                    println!("  #{} <{}> {}", message.sequence_number, message.source, message.payload);
                }
            }
            Err(e) => println!("[{}] {e}", now()),
        },
        cmd if cmd.starts_with('/') => {
            println!("[{}] unknown command {cmd}", now());
        }
        text => match handle.send_chat(text).await {
            Ok(seq) => tracing::debug!(seq, "chat queued"),
            Err(e) => println!("[{}] not sent: {e}", now()),
        },
    }
    true
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::PeerSetChanged(peers) => {
            println!("[{}] {} peer(s) in range", now(), peers.len());
        }
        EngineEvent::MessageDelivered(message) => {
            println!("[{}] <{}> {}", now(), message.source, message.payload);
        }
        EngineEvent::MessageAcknowledged { sequence_number, by } => {
            tracing::debug!(seq = sequence_number, by = %by, "delivered");
        }
        EngineEvent::MessageDeliveryFailed { message, reason } => {
            println!(
                "[{}] could not deliver #{} ({reason}): {}",
                now(),
                message.sequence_number,
                message.payload
            );
        }
    }
}

/// Local wall-clock time as "HH:MM:SS".
fn now() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
