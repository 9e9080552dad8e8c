//! Engine commands, errors, and events.
//!
//! This module defines the message types for communicating with the engine thread:
//! - `EngineCommand`: Requests sent by the console through `EngineHandle`
//! - `EngineError`: Errors that can occur during engine operations
//! - `PeerEvent`: Events published by the engine for the console to render
//!
//! All types are designed for message passing and follow the panic-free policy.

use std::fmt;
use std::net::SocketAddr;

use peerchat_core::{ConnectionId, PeerInfo};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Engine Commands
// ============================================================================

/// Commands sent to the engine thread.
///
/// Each command carries a oneshot channel for the response. The engine
/// answers from its own thread; the console awaits the receiver.
#[derive(Debug)]
pub enum EngineCommand {
    /// Open an outbound connection.
    ///
    /// Answered once the connect completed or failed, never before.
    ///
    /// # Errors
    /// - `EngineError::ConnectFailure` if the peer is unreachable or refuses
    /// - `EngineError::ShuttingDown` if shutdown has started
    Connect {
        addr: SocketAddr,
        respond_to: oneshot::Sender<Result<PeerInfo, EngineError>>,
    },

    /// Get one established connection.
    ///
    /// # Errors
    /// - `EngineError::NotFound` if the id is unknown
    Lookup {
        id: ConnectionId,
        respond_to: oneshot::Sender<Result<PeerInfo, EngineError>>,
    },

    /// Get all established connections in insertion order.
    List {
        respond_to: oneshot::Sender<Vec<PeerInfo>>,
    },

    /// Queue chat text on a connection.
    ///
    /// # Errors
    /// - `EngineError::NotFound` if the id is unknown
    /// - `EngineError::ReservedPayload` if the text carries the sentinel
    Send {
        id: ConnectionId,
        text: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },

    /// Close a connection cooperatively.
    ///
    /// Answered after the socket has been released.
    ///
    /// # Errors
    /// - `EngineError::NotFound` if the id is unknown or already closing
    Terminate {
        id: ConnectionId,
        respond_to: oneshot::Sender<Result<PeerInfo, EngineError>>,
    },

    /// Terminate every connection, close the listener and stop the loop.
    ///
    /// Answered after the loop has released every socket.
    Shutdown { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Engine Errors
// ============================================================================

/// Errors that can occur during engine operations.
///
/// Uses `thiserror` for ergonomic error handling and Display implementations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The listening socket could not be bound (usually port in use).
    #[error("failed to bind listener on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// The destination is unreachable, refused, or timed out.
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailure { addr: SocketAddr, reason: String },

    /// The requested connection was not found.
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    /// A connection with this id is already registered.
    #[error("connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    /// A read or write failed on a connection.
    #[error("i/o error on connection {id}: {reason}")]
    Io { id: ConnectionId, reason: String },

    /// Chat text equal to the termination sentinel.
    #[error("payload is reserved for connection termination")]
    ReservedPayload,

    /// Only loopback addresses exist on this host.
    #[error("no non-loopback local address available")]
    NoRoutableAddress,

    /// Creating the poller, waker or engine thread failed.
    #[error("engine setup failed: {0}")]
    Setup(String),

    /// The engine is shutting down and takes no new work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the engine thread has stopped.
    #[error("engine channel closed")]
    ChannelClosed,
}

impl EngineError {
    /// Creates a setup error from any error type.
    pub fn setup<E: fmt::Display>(err: E) -> Self {
        Self::Setup(err.to_string())
    }
}

// ============================================================================
// Peer Events
// ============================================================================

/// Events published by the engine to subscribers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A connection became established (accepted or connected).
    Connected { peer: PeerInfo },

    /// Chat text arrived.
    Message {
        id: ConnectionId,
        from: SocketAddr,
        text: String,
    },

    /// A connection was torn down.
    Disconnected {
        peer: PeerInfo,
        reason: DisconnectReason,
    },
}

/// Why a connection was torn down.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// A local `terminate` (or shutdown) closed it.
    LocalTerminate,

    /// The peer sent the termination sentinel.
    PeerTerminated,

    /// The peer closed the stream without the sentinel.
    PeerClosed,

    /// A read or write failed.
    Error(EngineError),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalTerminate => write!(f, "terminated locally"),
            Self::PeerTerminated => write!(f, "terminated by peer"),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::Error(err) => write!(f, "{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let addr: SocketAddr = "10.0.0.5:6000".parse().unwrap();

        let err = EngineError::Bind {
            addr,
            reason: "address in use".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to bind listener on 10.0.0.5:6000: address in use"
        );

        let err = EngineError::ConnectFailure {
            addr,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to 10.0.0.5:6000: connection refused"
        );

        let err = EngineError::NotFound(ConnectionId::new(3));
        assert_eq!(err.to_string(), "connection not found: 3");

        let err = EngineError::ChannelClosed;
        assert_eq!(err.to_string(), "engine channel closed");
    }

    #[test]
    fn test_engine_error_setup_helper() {
        let err = EngineError::setup("poll creation failed");
        assert!(matches!(err, EngineError::Setup(_)));
        assert_eq!(err.to_string(), "engine setup failed: poll creation failed");
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::LocalTerminate.to_string(), "terminated locally");
        assert_eq!(DisconnectReason::PeerTerminated.to_string(), "terminated by peer");
        assert_eq!(DisconnectReason::PeerClosed.to_string(), "closed by peer");

        let io = DisconnectReason::Error(EngineError::Io {
            id: ConnectionId::new(2),
            reason: "connection reset".to_string(),
        });
        assert_eq!(io.to_string(), "i/o error on connection 2: connection reset");
    }

    #[tokio::test]
    async fn test_command_channel_closed_error() {
        let (tx, rx) = oneshot::channel::<Result<(), EngineError>>();
        drop(tx);
        assert!(rx.await.is_err());
    }
}
