//! Peer connection identity, role and lifecycle.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Identifier of one peer connection.
///
/// Handed out by a monotonic counter in the engine. An id is never reused
/// within a process, so removing connection 1 leaves 2 and 3 untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|_| DomainError::InvalidConnectionId {
                value: s.to_string(),
            })
    }
}

// ============================================================================
// Role & Lifecycle
// ============================================================================

/// Which side opened the TCP link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Accepted by our listener.
    Inbound,
    /// Initiated by a local `connect`.
    Outbound,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// Lifecycle of a peer connection.
///
/// ```text
/// Connecting ──▶ Established ──▶ Closing ──▶ Closed
///  (outbound)        ▲
///                    └── inbound connections start here
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Outbound connect attempt in flight.
    Connecting,
    /// Bidirectional traffic allowed.
    Established,
    /// Termination initiated, waiting for the sentinel to flush.
    Closing,
    /// Terminal; the socket has been released.
    Closed,
}

impl LifecycleState {
    /// Whether user payloads may be queued in this state.
    #[must_use]
    pub fn accepts_payloads(self) -> bool {
        matches!(self, Self::Established)
    }

    /// Whether a state change to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Connecting, Established)
                | (Connecting, Closed)
                | (Established, Closing)
                | (Established, Closed)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

// ============================================================================
// Views
// ============================================================================

/// Read-only snapshot of a peer connection.
///
/// This is what leaves the engine thread; the socket and buffers never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub role: Role,
    pub state: LifecycleState,
    pub connected_at: DateTime<Utc>,
}

impl PeerInfo {
    pub fn remote_ip(&self) -> std::net::IpAddr {
        self.remote.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_parse() {
        assert_eq!("7".parse::<ConnectionId>().unwrap(), ConnectionId::new(7));
        assert_eq!(" 12 ".parse::<ConnectionId>().unwrap().get(), 12);
        let err = "x1".parse::<ConnectionId>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid connection id: x1 (expected a non-negative number)"
        );
        assert!("-1".parse::<ConnectionId>().is_err());
    }

    #[test]
    fn test_connection_id_ordering_follows_counter() {
        let mut ids = vec![ConnectionId::new(3), ConnectionId::new(1), ConnectionId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![ConnectionId::new(1), ConnectionId::new(2), ConnectionId::new(3)]);
    }

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Connecting.can_transition_to(Established));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Established.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Established));
        assert!(!Closing.can_transition_to(Established));
        assert!(!Established.can_transition_to(Connecting));
    }

    #[test]
    fn test_only_established_accepts_payloads() {
        assert!(LifecycleState::Established.accepts_payloads());
        assert!(!LifecycleState::Connecting.accepts_payloads());
        assert!(!LifecycleState::Closing.accepts_payloads());
        assert!(!LifecycleState::Closed.accepts_payloads());
    }

    #[test]
    fn test_peer_info_accessors() {
        let info = PeerInfo {
            id: ConnectionId::new(1),
            remote: "10.0.0.2:6000".parse().unwrap(),
            role: Role::Outbound,
            state: LifecycleState::Established,
            connected_at: Utc::now(),
        };
        assert_eq!(info.remote_ip().to_string(), "10.0.0.2");
        assert_eq!(info.remote_port(), 6000);
        assert_eq!(info.role.to_string(), "outbound");
    }
}
