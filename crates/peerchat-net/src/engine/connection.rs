//! Per-connection state machine.
//!
//! Each method here runs on the engine thread in response to one readiness
//! event and reports what the event loop should do next. None of them
//! touch the registry or the poller; teardown is decided by the caller.

use std::io;
use std::net::Shutdown;

use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use peerchat_core::LifecycleState;
use peerchat_protocol::{Inbound, Outbound};

use super::commands::{DisconnectReason, EngineError};
use crate::registry::{DrainOutcome, PeerConnection};
use crate::socket::{self, ConnectStatus, ReadOutcome};

/// Result of servicing a readable event.
#[derive(Debug, Default)]
pub(crate) struct Received {
    /// Chat text decoded from this event, in arrival order.
    pub messages: Vec<String>,
    /// Set when the link must be torn down after delivering `messages`.
    pub closed: Option<DisconnectReason>,
}

/// Result of servicing a writable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flushed {
    /// Queue still holds data; wait for the next writable event.
    Pending,
    /// Queue is empty.
    Idle,
    /// The sentinel has been written on a closing link.
    SentinelSent,
}

impl PeerConnection {
    /// Resolves an in-flight outbound connect.
    pub(crate) fn complete_connect(&mut self) -> ConnectStatus {
        let status = socket::connect_status(&self.stream);
        if matches!(status, ConnectStatus::Connected) {
            self.transition(LifecycleState::Established);
        }
        status
    }

    /// Drains the socket into the inbound accumulator and decodes it.
    ///
    /// # Errors
    ///
    /// Any read error other than `WouldBlock`; the caller tears down.
    pub(crate) fn receive(&mut self, scratch: &mut [u8]) -> Result<Received, EngineError> {
        let mut eof = false;
        loop {
            match socket::read_nonblocking(&mut self.stream, scratch).map_err(|e| self.io_error(e))? {
                ReadOutcome::Data(n) => {
                    trace!(id = %self.id, len = n, "Read from socket");
                    self.inbound.extend_from_slice(scratch.get(..n).unwrap_or_default());
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Closed => {
                    debug!(id = %self.id, peer = %self.remote, "Peer closed its stream");
                    eof = true;
                    break;
                }
            }
        }

        let mut received = Received::default();
        loop {
            let frame = if eof {
                self.codec.decode_eof(&mut self.inbound)
            } else {
                self.codec.decode(&mut self.inbound)
            }
            .map_err(|e| self.io_error(e))?;

            match frame {
                Some(Inbound::Message(text)) => received.messages.push(text),
                Some(Inbound::Terminate) => {
                    debug!(id = %self.id, peer = %self.remote, "Received termination sentinel");
                    received.closed = Some(DisconnectReason::PeerTerminated);
                    break;
                }
                None => break,
            }
        }

        if eof && received.closed.is_none() {
            received.closed = Some(DisconnectReason::PeerClosed);
        }
        Ok(received)
    }

    /// Writes queued payloads until the socket blocks or the queue empties.
    ///
    /// On a closing link an empty queue means the sentinel is out; the
    /// write side is then shut down so the peer sees it followed by EOF.
    ///
    /// # Errors
    ///
    /// Any write error other than `WouldBlock`; the caller tears down.
    pub(crate) fn flush(&mut self) -> Result<Flushed, EngineError> {
        if self.state == LifecycleState::Connecting {
            return Ok(Flushed::Pending);
        }
        if self.outbound.is_empty() {
            return Ok(Flushed::Idle);
        }

        let outcome = self
            .outbound
            .drain_into(&mut self.stream)
            .map_err(|e| self.io_error(e))?;

        match outcome {
            DrainOutcome::Blocked { written } => {
                trace!(id = %self.id, written, queued = self.outbound.len(), "Socket send buffer full");
                Ok(Flushed::Pending)
            }
            DrainOutcome::Drained { written } => {
                trace!(id = %self.id, written, "Outbound queue drained");
                if self.state != LifecycleState::Closing {
                    return Ok(Flushed::Idle);
                }
                if let Err(e) = self.stream.shutdown(Shutdown::Write) {
                    warn!(id = %self.id, error = %e, "Failed to half-close after sentinel");
                }
                Ok(Flushed::SentinelSent)
            }
        }
    }

    /// Starts a local termination: moves to `Closing` and queues the sentinel.
    ///
    /// Returns false if the connection was not established.
    pub(crate) fn begin_close(&mut self) -> bool {
        if !self.transition(LifecycleState::Closing) {
            return false;
        }
        self.outbound.push(Outbound::Terminate.into_bytes());
        true
    }

    /// Marks the connection closed just before it is dropped.
    pub(crate) fn mark_closed(&mut self) {
        self.transition(LifecycleState::Closed);
    }

    fn io_error(&self, err: io::Error) -> EngineError {
        EngineError::Io {
            id: self.id,
            reason: err.to_string(),
        }
    }
}
