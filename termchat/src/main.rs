// termchat: start a session and wait for a peer, or join one.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use termchat::config::{self, Config, DEFAULT_PORT};
use termchat::{telemetry, Endpoint, EndpointError, Event, EventReceiver, Target};
use termchat_core::{IdGenerator, Kind, Message, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const STDIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "termchat", about = "Ephemeral peer-to-peer terminal chat")]
struct Cli {
    /// More log output on stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new session and wait for a peer.
    Start {
        /// Port to listen on (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Join a session: user@host:session-id[:port].
    Join { target: Target },
    /// Print the version.
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Command::Version = cli.command {
        println!("termchat version {}", VERSION);
        return Ok(());
    }
    telemetry::init(cli.verbose);
    let cfg = config::load()?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async move {
        match cli.command {
            Command::Start { port } => start(cfg, port).await,
            Command::Join { target } => join(cfg, target).await,
            Command::Version => Ok(()),
        }
    });
    // The stdin reader sits on a blocking thread until the next newline; don't wait for it.
    rt.shutdown_timeout(STDIN_GRACE);
    result
}

async fn start(mut cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(p) = port {
        cfg.port = p;
    }
    let mut ids = IdGenerator::from_entropy();
    let session = Arc::new(Session::generate(&mut ids));
    let (endpoint, events) = Endpoint::listener(session.clone());
    let endpoint = endpoint.with_handshake_timeout(cfg.handshake_timeout());

    let local = match endpoint.listen(&cfg.listen_addr()).await {
        Ok(addr) => addr,
        Err(EndpointError::Bind { source, .. }) if source.kind() == io::ErrorKind::AddrInUse => {
            bail!(
                "port {} is already in use; free it or pick another with `termchat start --port {}`",
                cfg.port,
                cfg.port.saturating_sub(1).max(1)
            );
        }
        Err(e) => return Err(e).context("failed to start listener"),
    };

    println!("Session started: {}", session.id());
    println!("Listening on port {}", local.port());
    println!();
    println!("Share this with your chat partner:");
    if local.port() == DEFAULT_PORT {
        println!("  termchat join user@host:{}", session.id());
    } else {
        println!("  termchat join user@host:{}:{}", session.id(), local.port());
    }
    println!();
    println!("Waiting for connection... (type /quit to leave)");

    chat(endpoint, events).await
}

async fn join(cfg: Config, target: Target) -> anyhow::Result<()> {
    let session = Arc::new(Session::new(target.session_id.clone()));
    let (endpoint, events) = Endpoint::joiner(session);
    let endpoint = endpoint.with_handshake_timeout(cfg.handshake_timeout());

    if !target.is_local() {
        // Tunnel setup (e.g. `ssh -L`) is left to the user; dial the given host directly.
        info!(user = %target.user, host = %target.host, "dialing remote host directly");
    }
    println!("Connecting to {}@{}...", target.user, target.host);
    endpoint
        .connect(&target.addr())
        .await
        .context("failed to connect")?;
    println!("Connected! Type your messages below. (/quit to leave)");
    println!();

    chat(endpoint, events).await
}

/// Relay stdin lines to the peer and print events until either side leaves.
async fn chat(endpoint: Endpoint, mut events: EventReceiver) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::Connected) => println!("[Connected]"),
                Some(Event::Message(msg)) => render(&msg),
                Some(Event::Disconnected) | None => {
                    println!("[Disconnected]");
                    break;
                }
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim_end();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = endpoint.send_message(Message::text(line)).await {
                    eprintln!("[not sent: {}]", e);
                }
            },
            _ = &mut shutdown => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    endpoint.stop().await;
    Ok(())
}

fn render(msg: &Message) {
    match msg.kind {
        Kind::Text => println!("peer: {}", msg.content.as_deref().unwrap_or_default()),
        Kind::Error => println!(
            "[peer error: {}]",
            msg.content.as_deref().unwrap_or_default()
        ),
        Kind::Leave => println!("[Peer left]"),
        _ => {}
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
