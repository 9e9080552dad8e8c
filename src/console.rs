//! Interactive console.
//!
//! The console reads command lines, runs them against the engine through an
//! `EngineHandle`, and prints peer events as they arrive. Policy that the
//! engine leaves open lives here: self-connections and duplicate
//! connections are refused, and long messages get an advisory warning.
//!
//! All tasks respect a shared `CancellationToken` for graceful shutdown.

use std::fmt::Write as _;
use std::net::SocketAddr;

use peerchat_core::{ConnectionId, PeerInfo, Role};
use peerchat_net::{DisconnectReason, EngineHandle, PeerEvent};
use peerchat_protocol::ADVISORY_MESSAGE_LEN;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::{help_text, Command};

/// What the input loop does after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Print the text, if any, and read the next line.
    Continue(Option<String>),
    /// The engine has been shut down; stop reading.
    Exit,
}

impl Flow {
    fn say(text: impl Into<String>) -> Self {
        Self::Continue(Some(text.into()))
    }
}

/// Runs console commands against one engine.
pub struct Console {
    engine: EngineHandle,
    port: u16,
}

impl Console {
    /// `port` is the configured listening port, reported by `myport` even
    /// when the listener could not be bound.
    pub fn new(engine: EngineHandle, port: u16) -> Self {
        Self { engine, port }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    fn own_port(&self) -> u16 {
        self.engine
            .listen_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.port)
    }

    /// Executes one parsed command.
    pub async fn execute(&self, command: Command) -> Flow {
        match command {
            Command::Help(topic) => Flow::say(help_text(topic.as_deref())),
            Command::MyIp => match self.engine.local_ip() {
                Some(ip) => Flow::say(ip.to_string()),
                None => Flow::say("Error getting IP: no non-loopback local address available"),
            },
            Command::MyPort => Flow::say(self.own_port().to_string()),
            Command::Connect(addr) => self.connect(addr).await,
            Command::List => Flow::say(render_list(&self.engine.list().await)),
            Command::Terminate(id) => self.terminate(id).await,
            Command::Send { id, text } => self.send(id, text).await,
            Command::Exit => {
                self.engine.shutdown().await;
                Flow::Exit
            }
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Flow {
        if self.is_self(addr) {
            return Flow::say(format!("Error: {addr} is this process; self-connections are not allowed"));
        }
        if self
            .engine
            .list()
            .await
            .iter()
            .any(|peer| peer.remote == addr)
        {
            return Flow::say(format!("Error: already connected to {addr}"));
        }

        match self.engine.connect(addr).await {
            Ok(peer) => Flow::say(format!(
                "Connected to {}:{} (id {})",
                peer.remote_ip(),
                peer.remote_port(),
                peer.id
            )),
            Err(e) => Flow::say(format!("Error connecting to {addr}: {e}")),
        }
    }

    /// Own address on the listening port, or loopback on it.
    fn is_self(&self, addr: SocketAddr) -> bool {
        if addr.port() != self.own_port() {
            return false;
        }
        let ip = addr.ip();
        ip.is_loopback()
            || ip.is_unspecified()
            || Some(ip) == self.engine.local_ip()
            || Some(ip) == self.engine.listen_addr().map(|a| a.ip())
    }

    async fn terminate(&self, id: ConnectionId) -> Flow {
        match self.engine.terminate(id).await {
            Ok(peer) => Flow::say(format!(
                "Connection {} to {}:{} terminated",
                peer.id,
                peer.remote_ip(),
                peer.remote_port()
            )),
            Err(e) => Flow::say(format!("Error: {e}")),
        }
    }

    async fn send(&self, id: ConnectionId, text: String) -> Flow {
        let mut out = String::new();
        if text.chars().count() > ADVISORY_MESSAGE_LEN {
            let _ = writeln!(
                out,
                "Warning: message is longer than {ADVISORY_MESSAGE_LEN} characters"
            );
        }
        match self.engine.send(id, text).await {
            Ok(()) => out.push_str(&format!("Message sent to {id}")),
            Err(e) => out.push_str(&format!("Error: {e}")),
        }
        Flow::say(out)
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Table printed by `list`.
pub fn render_list(peers: &[PeerInfo]) -> String {
    let mut out = String::from("id:\tIP address\tPort No.");
    for peer in peers {
        let _ = write!(
            out,
            "\n{}\t{}\t{}",
            peer.id,
            peer.remote_ip(),
            peer.remote_port()
        );
    }
    out
}

/// Console text for a peer event, or `None` for events the console
/// already reported as a command result.
pub fn render_event(event: &PeerEvent) -> Option<String> {
    match event {
        PeerEvent::Connected { peer } => match peer.role {
            Role::Inbound => Some(format!(
                "Accepted connection from {}:{}",
                peer.remote_ip(),
                peer.remote_port()
            )),
            Role::Outbound => None,
        },
        PeerEvent::Message { from, text, .. } => Some(format!(
            "Message received from {}\nSender's Port: {}\nMessage: \"{}\"",
            from.ip(),
            from.port(),
            text
        )),
        PeerEvent::Disconnected { peer, reason } => match reason {
            DisconnectReason::LocalTerminate => None,
            DisconnectReason::PeerTerminated => Some(format!(
                "Peer {}:{} terminated the connection",
                peer.remote_ip(),
                peer.remote_port()
            )),
            DisconnectReason::PeerClosed => Some(format!(
                "Peer {}:{} closed the connection",
                peer.remote_ip(),
                peer.remote_port()
            )),
            DisconnectReason::Error(e) => Some(format!(
                "Connection {} to {}:{} failed: {e}",
                peer.id,
                peer.remote_ip(),
                peer.remote_port()
            )),
        },
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Prints peer events until cancelled or the engine goes away.
pub fn spawn_event_printer(
    mut events: broadcast::Receiver<PeerEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = events.recv() => match result {
                    Ok(event) => {
                        if let Some(text) = render_event(&event) {
                            println!("{text}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Console fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Event printer stopped");
    })
}

/// Reads and executes commands until `exit`, end of input, or cancellation.
///
/// Every way out shuts the engine down first.
///
/// # Errors
///
/// Returns the input error if reading a line fails; the engine is still
/// shut down.
pub async fn run<R>(console: &Console, input: R, cancel: CancellationToken) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => None,
            line = lines.next_line() => match line {
                Ok(line) => line,
                Err(e) => {
                    console.engine.shutdown().await;
                    return Err(e);
                }
            },
        };

        let Some(line) = line else {
            console.engine.shutdown().await;
            return Ok(());
        };

        match Command::parse(&line) {
            Ok(None) => {}
            Ok(Some(command)) => match console.execute(command).await {
                Flow::Continue(Some(text)) => println!("{text}"),
                Flow::Continue(None) => {}
                Flow::Exit => return Ok(()),
            },
            Err(e) => println!("{e}"),
        }
    }
}
