//! Per-connection state owned by the registry.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use mio::net::TcpStream;

use peerchat_core::{ConnectionId, LifecycleState, PeerInfo, Role};
use peerchat_protocol::PayloadCodec;

use crate::socket::{write_nonblocking, WriteOutcome};

// ============================================================================
// Outbound Queue
// ============================================================================

/// FIFO of payloads waiting for a writable socket.
///
/// The head payload is written from `cursor` onwards, so a partial write
/// resumes exactly where the OS stopped accepting bytes.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<Bytes>,
    current: Option<Bytes>,
    cursor: usize,
}

/// What a drain pass achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every queued byte was handed to the OS.
    Drained { written: usize },
    /// The OS stopped accepting bytes; the rest stays queued.
    Blocked { written: usize },
}

impl OutboundQueue {
    pub fn push(&mut self, payload: Bytes) {
        if !payload.is_empty() {
            self.pending.push_back(payload);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Number of payloads not yet fully written.
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }

    /// Bytes of the head payload already written.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Writes queued payloads into `sink` until it blocks or the queue empties.
    pub fn drain_into<W: Write>(&mut self, sink: &mut W) -> io::Result<DrainOutcome> {
        let mut written = 0;
        loop {
            if self.current.is_none() {
                self.current = self.pending.pop_front();
                self.cursor = 0;
            }
            let Some(current) = self.current.as_ref() else {
                return Ok(DrainOutcome::Drained { written });
            };

            let remaining = current.get(self.cursor..).unwrap_or_default();
            if remaining.is_empty() {
                self.current = None;
                continue;
            }

            match write_nonblocking(sink, remaining)? {
                WriteOutcome::Written(n) => {
                    self.cursor += n;
                    written += n;
                    if self.cursor >= current.len() {
                        self.current = None;
                        self.cursor = 0;
                    }
                }
                WriteOutcome::WouldBlock => return Ok(DrainOutcome::Blocked { written }),
            }
        }
    }
}

// ============================================================================
// Peer Connection
// ============================================================================

/// One TCP link, inbound or outbound.
///
/// Owns its socket exclusively. Dropping the connection closes the socket,
/// so a connection removed from the registry is closed exactly once.
#[derive(Debug)]
pub struct PeerConnection {
    pub(crate) id: ConnectionId,
    pub(crate) remote: SocketAddr,
    pub(crate) role: Role,
    pub(crate) state: LifecycleState,
    pub(crate) connected_at: DateTime<Utc>,
    pub(crate) stream: TcpStream,
    pub(crate) outbound: OutboundQueue,
    pub(crate) inbound: BytesMut,
    pub(crate) codec: PayloadCodec,
}

impl PeerConnection {
    /// Wraps an accepted socket; inbound links start established.
    pub fn inbound(id: ConnectionId, remote: SocketAddr, stream: TcpStream) -> Self {
        Self::new(id, remote, Role::Inbound, LifecycleState::Established, stream)
    }

    /// Wraps a socket whose connect is still in flight.
    pub fn outbound(id: ConnectionId, remote: SocketAddr, stream: TcpStream) -> Self {
        Self::new(id, remote, Role::Outbound, LifecycleState::Connecting, stream)
    }

    fn new(
        id: ConnectionId,
        remote: SocketAddr,
        role: Role,
        state: LifecycleState,
        stream: TcpStream,
    ) -> Self {
        Self {
            id,
            remote,
            role,
            state,
            connected_at: Utc::now(),
            stream,
            outbound: OutboundQueue::default(),
            inbound: BytesMut::new(),
            codec: PayloadCodec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn outbound_queue(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Snapshot for callers outside the engine thread.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            remote: self.remote,
            role: self.role,
            state: self.state,
            connected_at: self.connected_at,
        }
    }

    /// Moves to `next` if the lifecycle allows it.
    ///
    /// Returns false (and leaves the state alone) for illegal transitions.
    pub(crate) fn transition(&mut self, next: LifecycleState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
