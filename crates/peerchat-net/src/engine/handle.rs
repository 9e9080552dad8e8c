//! Client interface for interacting with the engine thread.
//!
//! The `EngineHandle` provides a cheap-to-clone interface for sending commands
//! to the event loop and subscribing to peer events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `EngineError::ChannelClosed`

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use mio::Waker;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use peerchat_core::{ConnectionId, PeerInfo};

use super::commands::{EngineCommand, EngineError, PeerEvent};
use super::ListenerStatus;

// ============================================================================
// Engine Handle
// ============================================================================

/// Handle for interacting with the engine.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// Every request is sent over the command channel, then the poll is woken
/// so the engine thread picks it up on its next iteration.
///
/// # Usage
///
/// ```ignore
/// let peer = handle.connect("192.168.1.8:5000".parse()?).await?;
/// handle.send(peer.id, "hello world".to_string()).await?;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Render event
/// }
/// ```
#[derive(Clone)]
pub struct EngineHandle {
    /// Command path to the event loop, shared by every clone
    link: Arc<CommandLink>,

    /// Event broadcaster for subscribing to peer events
    event_sender: broadcast::Sender<PeerEvent>,

    /// Listener outcome decided at startup
    listener: ListenerStatus,

    /// Address the endpoint advertises
    local_ip: Option<IpAddr>,
}

/// Command sender plus the waker that interrupts the engine's poll.
///
/// Dropped together with the last handle clone. The sender is closed before
/// the wake so the loop observes the disconnect on that same iteration.
struct CommandLink {
    sender: Option<mpsc::Sender<EngineCommand>>,
    waker: Arc<Waker>,
}

impl CommandLink {
    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake engine");
        }
    }
}

impl Drop for CommandLink {
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            debug!("Last engine handle dropped");
            self.wake();
        }
    }
}

impl EngineHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<EngineCommand>,
        waker: Arc<Waker>,
        event_sender: broadcast::Sender<PeerEvent>,
        listener: ListenerStatus,
        local_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            link: Arc::new(CommandLink {
                sender: Some(sender),
                waker,
            }),
            event_sender,
            listener,
            local_ip,
        }
    }

    /// Opens an outbound connection and waits until it is established.
    ///
    /// # Errors
    ///
    /// - `EngineError::ConnectFailure` if the peer is unreachable, refuses,
    ///   or does not answer within the connect timeout
    /// - `EngineError::ShuttingDown` if shutdown has started
    /// - `EngineError::ChannelClosed` if the engine has stopped
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerInfo, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(EngineCommand::Connect {
            addr,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Get one established connection.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotFound` if the id is unknown
    /// - `EngineError::ChannelClosed` if the engine has stopped
    pub async fn lookup(&self, id: ConnectionId) -> Result<PeerInfo, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(EngineCommand::Lookup { id, respond_to: tx })
            .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Get all established connections in insertion order.
    ///
    /// Returns an empty vector if communication with the engine fails.
    pub async fn list(&self) -> Vec<PeerInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .dispatch(EngineCommand::List { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Queues chat text on a connection.
    ///
    /// Returns once the text is queued; delivery happens as the socket
    /// becomes writable.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotFound` if the id is unknown
    /// - `EngineError::ReservedPayload` if the text carries the sentinel
    /// - `EngineError::ChannelClosed` if the engine has stopped
    pub async fn send(&self, id: ConnectionId, text: String) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(EngineCommand::Send {
            id,
            text,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Terminates a connection and waits until its socket is released.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotFound` if the id is unknown or already terminating
    /// - `EngineError::ChannelClosed` if the engine has stopped
    pub async fn terminate(&self, id: ConnectionId) -> Result<PeerInfo, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(EngineCommand::Terminate { id, respond_to: tx })
            .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Terminates every connection and stops the engine.
    ///
    /// Waits for the loop to finish. Calling this on a stopped engine is a
    /// no-op.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .dispatch(EngineCommand::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    /// Subscribe to peer events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_sender.subscribe()
    }

    /// Listener outcome decided at startup.
    pub fn listener_status(&self) -> &ListenerStatus {
        &self.listener
    }

    /// Address the listener is bound to, if any.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Non-loopback address of this endpoint, if one was found.
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    /// Check if the engine is still running.
    pub fn is_connected(&self) -> bool {
        self.link
            .sender
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    async fn dispatch(&self, command: EngineCommand) -> Result<(), EngineError> {
        let sender = self.link.sender.as_ref().ok_or(EngineError::ChannelClosed)?;
        sender
            .send(command)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        self.link.wake();
        Ok(())
    }
}
