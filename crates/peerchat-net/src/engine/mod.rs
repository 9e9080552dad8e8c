//! Connection engine using the Actor pattern.
//!
//! The engine owns the listener, every peer socket and the connection
//! registry. It runs a `mio` readiness loop on a dedicated thread, receives
//! commands via a tokio mpsc channel (plus a `mio::Waker` to interrupt the
//! poll) and publishes `PeerEvent`s on a broadcast channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │    Console      │────▶│    EventLoop    │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                        │
//!         │   EngineCommand       │   PeerEvent            │
//!         │   (mpsc + Waker)      │   (broadcast)          │
//!         ▼                       ▼                        ▼
//!   connect/send/           ConnectionRegistry       console output
//!   terminate/list          + mio::Poll
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Interest, Poll, Token, Waker};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use peerchat_core::DEFAULT_PORT;

use crate::socket;

mod commands;
mod connection;
mod event_loop;
mod handle;

pub use commands::{DisconnectReason, EngineCommand, EngineError, PeerEvent};
pub use handle::EngineHandle;

use event_loop::EventLoop;

/// Channel buffer size for console → engine commands.
const COMMAND_BUFFER: usize = 100;

/// Poll token of the listening socket.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Poll token of the command waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the connection engine.
///
/// # Example
///
/// ```rust
/// use peerchat_net::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     port: 6000,
///     flush_delay: Duration::from_millis(250),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port the listener binds to. `0` picks an ephemeral port.
    pub port: u16,

    /// Address the listener binds to. `None` selects the non-loopback
    /// local address.
    pub bind_address: Option<IpAddr>,

    /// How long a terminated connection may take to flush the sentinel.
    pub flush_delay: Duration,

    /// How long an outbound connect may stay in flight.
    pub connect_timeout: Duration,

    /// Size of the scratch buffer used for each socket read.
    pub read_chunk_size: usize,

    /// Capacity of the readiness event buffer.
    pub poll_capacity: usize,

    /// Capacity of the `PeerEvent` broadcast channel.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: None,
            flush_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            read_chunk_size: 4096,
            poll_capacity: 128,
            event_buffer: 256,
        }
    }
}

/// Whether this endpoint accepts inbound connections.
#[derive(Debug, Clone)]
pub enum ListenerStatus {
    /// Listening on this address.
    Listening(SocketAddr),
    /// No listener; outbound connections still work.
    ClientOnly { reason: EngineError },
}

impl ListenerStatus {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Listening(addr) => Some(*addr),
            Self::ClientOnly { .. } => None,
        }
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Starts the engine and returns a handle for interaction.
///
/// This function:
/// 1. Creates the poller and the command waker
/// 2. Binds the listener (a bind failure degrades to client-only mode)
/// 3. Spawns the event loop on its own thread
/// 4. Returns an `EngineHandle` that already knows the listener status
///
/// # Errors
///
/// `EngineError::Setup` if the poller, waker or thread cannot be created.
/// A failed bind is not an error; see `EngineHandle::listener_status`.
///
/// # Example
///
/// ```no_run
/// use peerchat_net::{spawn_engine, EngineConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_engine(EngineConfig::default()).expect("engine");
///
///     let peers = handle.list().await;
///     println!("{} connections", peers.len());
/// }
/// ```
pub fn spawn_engine(config: EngineConfig) -> Result<EngineHandle, EngineError> {
    let poll = Poll::new().map_err(EngineError::setup)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(EngineError::setup)?);

    let local_ip = match config.bind_address {
        Some(ip) => Some(ip),
        None => socket::local_ip().ok(),
    };
    let (listener, status) = bind_listener(&poll, local_ip, config.port);

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));

    let event_loop = EventLoop::new(poll, listener, cmd_rx, event_tx.clone(), config);
    thread::Builder::new()
        .name("peerchat-engine".to_string())
        .spawn(move || event_loop.run())
        .map_err(EngineError::setup)?;

    Ok(EngineHandle::new(cmd_tx, waker, event_tx, status, local_ip))
}

/// Binds and registers the listener, or explains why there is none.
fn bind_listener(
    poll: &Poll,
    local_ip: Option<IpAddr>,
    port: u16,
) -> (Option<TcpListener>, ListenerStatus) {
    let Some(ip) = local_ip else {
        warn!("No routable local address, running in client-only mode");
        return (
            None,
            ListenerStatus::ClientOnly {
                reason: EngineError::NoRoutableAddress,
            },
        );
    };

    let addr = SocketAddr::new(ip, port);
    let result = socket::listen(addr).and_then(|mut listener| {
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|e| EngineError::Bind {
                addr,
                reason: e.to_string(),
            })?;
        let bound = listener.local_addr().map_err(|e| EngineError::Bind {
            addr,
            reason: e.to_string(),
        })?;
        Ok((listener, bound))
    });

    match result {
        Ok((listener, bound)) => {
            info!(addr = %bound, "Listening for peers");
            (Some(listener), ListenerStatus::Listening(bound))
        }
        Err(reason) => {
            warn!(error = %reason, "Listener unavailable, running in client-only mode");
            (None, ListenerStatus::ClientOnly { reason })
        }
    }
}
