// wsstar-cli: rendezvous transport command line
//
// Runs a signaling server, or a peer that listens and dials through one.

mod config;
mod identity;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use libp2p::Multiaddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wsstar_core::server::ws;
use wsstar_core::transport::addr;
use wsstar_core::{Connection, ListenerEvent, SignalServer, WebSocketStar};

#[derive(Parser)]
#[command(name = "wsstar")]
#[command(about = "Rendezvous transport over a signaling server", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a signaling server
    Server {
        /// Address to bind, e.g. 0.0.0.0:9090
        #[arg(short, long)]
        bind: Option<String>,
        /// Require a signed challenge before peers may join
        #[arg(long)]
        require_proof: bool,
    },
    /// Announce a rendezvous address and echo whatever dialers send
    Listen {
        /// e.g. /ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star
        addr: String,
        /// Join without an identity
        #[arg(long)]
        anonymous: bool,
    },
    /// Listen on `via`, dial `target` through it and send one message
    Dial {
        via: String,
        target: String,
        message: String,
        #[arg(long)]
        anonymous: bool,
    },
    /// Show identity information
    Identity,
    /// Inspect or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    wsstar_core::init_tracing();

    let cli = Cli::parse();
    let config_path = config::Config::resolve_path(cli.config.as_deref())?;
    let config = config::Config::load(&config_path)?;

    match cli.command {
        Commands::Server { bind, require_proof } => cmd_server(config, bind, require_proof).await,
        Commands::Listen { addr, anonymous } => cmd_listen(config, addr, anonymous).await,
        Commands::Dial {
            via,
            target,
            message,
            anonymous,
        } => cmd_dial(config, via, target, message, anonymous).await,
        Commands::Identity => cmd_identity(&config),
        Commands::Config { action } => cmd_config(config, &config_path, action),
    }
}

fn parse_addr(s: &str) -> Result<Multiaddr> {
    let parsed: Multiaddr = s.parse().with_context(|| format!("Invalid multiaddr: {}", s))?;
    if !addr::is_rendezvous(&parsed) {
        anyhow::bail!("Not a rendezvous address: {}", s);
    }
    Ok(parsed)
}

/// Transport, and the address to announce with its peer id appended
fn build_transport(
    config: &config::Config,
    listen_addr: Multiaddr,
    anonymous: bool,
) -> Result<(WebSocketStar, Multiaddr)> {
    let transport = WebSocketStar::new(config.transport.clone());
    if anonymous {
        return Ok((transport, listen_addr));
    }

    let keys = identity::load_or_create(&config.identity_file()?)?;
    let peer_id = keys.peer_id().context("Failed to derive peer id")?;
    let announced = addr::with_peer_id(&listen_addr, peer_id);
    Ok((transport.with_identity(keys), announced))
}

async fn cmd_server(config: config::Config, bind: Option<String>, require_proof: bool) -> Result<()> {
    let mut server_config = config.server.clone();
    server_config.require_proof |= require_proof;
    let bind = bind.unwrap_or(config.bind);

    let server = Arc::new(SignalServer::with_config(server_config.clone()));
    let (local, handle) = ws::spawn_server(&bind, Arc::clone(&server))
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    println!("{}", "Signaling server running".bold());
    println!("  Bound:         {}", local.to_string().bright_cyan());
    println!(
        "  Listen on:     {}",
        format!("/ip4/{}/tcp/{}/ws/p2p-websocket-star", local.ip(), local.port()).bright_green()
    );
    println!("  Require proof: {}", server_config.require_proof);
    println!();
    println!("{}", "Press Ctrl+C to stop".dimmed());

    tokio::select! {
        result = handle => {
            result.context("Server task panicked")?.context("Server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    let stats = server.get_stats();
    println!();
    println!("{}", "Server statistics".bold());
    println!("  Connections:   {}", stats.connections_active);
    println!("  Peers joined:  {}", stats.peers_joined);
    println!("  Dials relayed: {}", stats.dials_relayed);
    println!("  Bytes relayed: {}", stats.bytes_relayed);
    Ok(())
}

async fn cmd_listen(config: config::Config, addr: String, anonymous: bool) -> Result<()> {
    let listen_addr = parse_addr(&addr)?;
    let (transport, announced) = build_transport(&config, listen_addr, anonymous)?;

    let listener = transport.create_listener(|conn: Connection| {
        tokio::spawn(echo(conn));
    });
    let mut events = listener.subscribe();
    let mut peers = transport.discovery().subscribe();

    listener
        .listen(announced.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", announced))?;

    println!("{} Listening as {}", "✓".green(), announced.to_string().bright_cyan());
    println!("{}", "Press Ctrl+C to stop".dimmed());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ListenerEvent::Connection(info)) => {
                    println!("{} Dial {} from {}", "→".bright_green(), info.dial_id, info.remote_addr);
                }
                Ok(ListenerEvent::Reconnected) => println!("{} Rejoined after reconnect", "↻".yellow()),
                Ok(ListenerEvent::Error(e)) => println!("{} {}", "✗".red(), e),
                Ok(ListenerEvent::Close) | Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Ok(ListenerEvent::Listening) | Err(_) => {}
            },
            peer = peers.recv() => {
                if let Ok(peer) = peer {
                    println!("{} Peer {}", "•".bright_blue(), peer.peer_id.to_string().bright_cyan());
                    for a in &peer.addrs {
                        println!("    {}", a.to_string().dimmed());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    listener.close().await;
    Ok(())
}

/// Print what arrives and send it back
async fn echo(mut conn: Connection) {
    let dial = conn.dial_id();
    while let Some(payload) = conn.recv().await {
        println!("  [{}] {}", dial, String::from_utf8_lossy(&payload));
        if conn.send(payload).is_err() {
            break;
        }
    }
    tracing::debug!("Dial {} ended", dial);
}

async fn cmd_dial(
    config: config::Config,
    via: String,
    target: String,
    message: String,
    anonymous: bool,
) -> Result<()> {
    let via = parse_addr(&via)?;
    let target = parse_addr(&target)?;
    let (transport, announced) = build_transport(&config, via, anonymous)?;

    let listener = transport.create_listener(|conn: Connection| drop(conn));
    listener
        .listen(announced.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", announced))?;

    let mut conn = transport
        .dial(&target)
        .await
        .with_context(|| format!("Failed to dial {}", target))?;
    println!("{} Connected to {}", "✓".green(), target.to_string().bright_cyan());

    conn.send(message.into_bytes()).context("Failed to send message")?;
    let reply = tokio::time::timeout(Duration::from_secs(config.reply_timeout), conn.recv()).await;
    match reply {
        Ok(Some(payload)) => println!("  Reply: {}", String::from_utf8_lossy(&payload).bright_yellow()),
        Ok(None) => println!("{}", "Connection closed without a reply".dimmed()),
        Err(_) => println!("{}", "No reply before timeout".dimmed()),
    }

    conn.close();
    listener.close().await;
    Ok(())
}

fn cmd_identity(config: &config::Config) -> Result<()> {
    let path = config.identity_file()?;
    let keys = identity::load_or_create(&path)?;
    let peer_id = keys.peer_id().context("Failed to derive peer id")?;

    println!("{}", "Identity Information".bold());
    println!("  Peer ID:    {}", peer_id.to_string().bright_cyan());
    println!("  Public Key: {}", keys.public_key_hex().bright_yellow());
    println!("  Stored in:  {}", path.display().to_string().dimmed());
    Ok(())
}

fn cmd_config(mut config: config::Config, path: &std::path::Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<24} {}", key, value.bright_cyan());
            }
        }
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save(path)?;
            println!("{} {} = {}", "✓".green(), key, value.bright_cyan());
        }
    }
    Ok(())
}
