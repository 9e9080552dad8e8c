//! Connection registry.
//!
//! The registry is the authoritative map from [`ConnectionId`] to
//! [`PeerConnection`]. It is owned by the engine thread; the console never
//! sees it directly and reaches it only through `EngineCommand`s.
//!
//! Ids come from a monotonic counter and are never reused, so the id order
//! of the underlying `BTreeMap` is also the insertion order shown by `list`.
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - Unknown ids are reported as `EngineError::NotFound`
//! - Removing twice returns `NotFound` instead of closing a socket twice

use std::collections::BTreeMap;

use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::debug;

use peerchat_core::{ConnectionId, LifecycleState, PeerInfo};
use peerchat_protocol::Outbound;

use crate::engine::EngineError;

mod peer;

pub use peer::{DrainOutcome, OutboundQueue, PeerConnection};

/// First id handed out; ids count up from here.
const FIRST_CONNECTION_ID: u64 = 1;

/// Map of live peer connections keyed by id.
#[derive(Debug)]
pub struct ConnectionRegistry {
    peers: BTreeMap<ConnectionId, PeerConnection>,
    next_id: u64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            next_id: FIRST_CONNECTION_ID,
        }
    }

    /// Reserves the next id. Ids are never handed out twice.
    pub fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    /// Takes ownership of a connection.
    ///
    /// # Errors
    ///
    /// `EngineError::DuplicateConnection` if the id is already present.
    pub fn insert(&mut self, peer: PeerConnection) -> Result<ConnectionId, EngineError> {
        let id = peer.id();
        if self.peers.contains_key(&id) {
            return Err(EngineError::DuplicateConnection(id));
        }
        debug!(id = %id, peer = %peer.remote(), role = %peer.role(), "Registered connection");
        self.peers.insert(id, peer);
        Ok(id)
    }

    pub fn lookup(&self, id: ConnectionId) -> Result<&PeerConnection, EngineError> {
        self.peers.get(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn lookup_mut(&mut self, id: ConnectionId) -> Result<&mut PeerConnection, EngineError> {
        self.peers.get_mut(&id).ok_or(EngineError::NotFound(id))
    }

    /// Removes a connection and hands its ownership back to the caller.
    pub fn remove(&mut self, id: ConnectionId) -> Result<PeerConnection, EngineError> {
        self.peers.remove(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Established connections in insertion order.
    pub fn list_all(&self) -> Vec<PeerInfo> {
        self.peers
            .values()
            .filter(|peer| peer.state() == LifecycleState::Established)
            .map(PeerConnection::info)
            .collect()
    }

    /// Every id currently owned, whatever its state.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    /// Ids of connections in `state`.
    pub fn ids_in(&self, state: LifecycleState) -> Vec<ConnectionId> {
        self.peers
            .values()
            .filter(|peer| peer.state() == state)
            .map(PeerConnection::id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Queues a payload for transmission on `id`.
    ///
    /// Chat messages need an established link; the termination sentinel may
    /// also be queued while closing.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotFound` if the id is unknown or not accepting payloads
    /// - `EngineError::ReservedPayload` if chat text contains the sentinel or
    ///   ends with a prefix of it
    pub fn enqueue_outbound(
        &mut self,
        id: ConnectionId,
        payload: Outbound,
    ) -> Result<(), EngineError> {
        let peer = self.lookup_mut(id)?;

        match &payload {
            Outbound::Message(_) if payload.is_control() => {
                return Err(EngineError::ReservedPayload);
            }
            Outbound::Message(_) if !peer.state().accepts_payloads() => {
                return Err(EngineError::NotFound(id));
            }
            Outbound::Terminate
                if !matches!(
                    peer.state(),
                    LifecycleState::Established | LifecycleState::Closing
                ) =>
            {
                return Err(EngineError::NotFound(id));
            }
            _ => {}
        }

        let mut buf = BytesMut::new();
        peer.codec
            .encode(payload, &mut buf)
            .map_err(|e| EngineError::Io {
                id,
                reason: e.to_string(),
            })?;
        debug!(id = %id, len = buf.len(), "Queued outbound payload");
        peer.outbound.push(buf.freeze());
        Ok(())
    }
}
