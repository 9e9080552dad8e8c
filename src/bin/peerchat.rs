//! peerchat - peer-to-peer TCP chat endpoint
//!
//! Starts the connection engine (listener plus readiness loop on its own
//! thread) and an interactive console on stdin.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port 5000
//! peerchat
//!
//! # Listen on port 6000
//! peerchat 6000
//!
//! # Use a specific settings file and bind address
//! peerchat 6000 --config ./peerchat.toml --bind 192.168.1.8
//!
//! # Enable debug logging (logs go to stderr)
//! RUST_LOG=peerchat_net=debug peerchat
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: terminate every connection, then exit

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use peerchat::console::{self, Console};
use peerchat::settings::Settings;
use peerchat_net::{spawn_engine, ListenerStatus};

/// peerchat - chat with peers over plain TCP
#[derive(Parser, Debug)]
#[command(name = "peerchat", version, about)]
struct Args {
    /// Listening port (1024-65535); invalid values fall back to 5000
    port: Option<String>,

    /// Settings file (default: <config dir>/peerchat/config.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on instead of the detected non-loopback address
    #[arg(long, short = 'b')]
    bind: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peerchat=warn,peerchat_net=warn")),
        )
        .init();

    let settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    let port = settings.resolve_port(args.port.as_deref());
    let config = settings.to_engine_config(port, args.bind);

    info!(version = env!("CARGO_PKG_VERSION"), port = %port, "peerchat starting");

    let engine = spawn_engine(config).context("Failed to start connection engine")?;
    match engine.listener_status() {
        ListenerStatus::Listening(addr) => println!("Listening on {addr}"),
        ListenerStatus::ClientOnly { reason } => {
            println!("Not accepting connections ({reason}); outbound connections still work");
        }
    }
    println!("Type 'help' for the list of commands.");

    let cancel = CancellationToken::new();

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let printer = console::spawn_event_printer(engine.subscribe(), cancel.clone());
    let console = Console::new(engine, port.get());

    let result = console::run(&console, BufReader::new(tokio::io::stdin()), cancel.clone()).await;

    cancel.cancel();
    let _ = printer.await;
    info!("peerchat stopped");

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Failed to read console input: {e}");
            1
        }
    };
    // A pending stdin read holds a blocking thread that runtime shutdown would wait on.
    std::process::exit(code)
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
