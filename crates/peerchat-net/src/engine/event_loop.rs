//! Event loop - owns every socket and processes readiness events and commands.
//!
//! The loop is the single owner of the listener, the connection registry and
//! all in-flight bookkeeping. It runs on the engine thread and never blocks
//! except in `Poll::poll`, whose timeout is the nearest pending deadline.
//!
//! `mio` is edge-triggered: every readable event drains the socket until it
//! would block, every writable event drains the outbound queue, and the
//! listener accepts until its backlog is empty.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Response send failures are ignored; the caller may have gone away
//! - Broadcast send failures only mean nobody is subscribed

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use peerchat_core::{ConnectionId, LifecycleState, PeerInfo};
use peerchat_protocol::Outbound;

use super::commands::{DisconnectReason, EngineCommand, EngineError, PeerEvent};
use super::connection::Flushed;
use super::{EngineConfig, LISTENER_TOKEN, WAKER_TOKEN};
use crate::registry::{ConnectionRegistry, PeerConnection};
use crate::socket::{self, ConnectStatus};

/// An outbound connect waiting for its socket to resolve.
struct PendingConnect {
    addr: SocketAddr,
    respond_to: oneshot::Sender<Result<PeerInfo, EngineError>>,
    deadline: Instant,
}

/// A locally terminated connection waiting for its sentinel to go out.
struct ClosingState {
    /// `None` when the close was started by shutdown.
    respond_to: Option<oneshot::Sender<Result<PeerInfo, EngineError>>>,
    deadline: Instant,
}

fn token_for(id: ConnectionId) -> Token {
    Token(id.get() as usize)
}

fn id_for(token: Token) -> ConnectionId {
    ConnectionId::new(token.0 as u64)
}

// ============================================================================
// Event Loop
// ============================================================================

/// The engine's readiness loop.
///
/// Commands arrive on the mpsc channel and are drained every iteration; the
/// handle wakes the poll after sending so none of them wait for network
/// activity.
pub(crate) struct EventLoop {
    poll: Poll,
    listener: Option<TcpListener>,
    registry: ConnectionRegistry,

    pending_connects: HashMap<ConnectionId, PendingConnect>,
    closing: HashMap<ConnectionId, ClosingState>,

    receiver: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<PeerEvent>,

    config: EngineConfig,
    scratch: Vec<u8>,

    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl EventLoop {
    pub(crate) fn new(
        poll: Poll,
        listener: Option<TcpListener>,
        receiver: mpsc::Receiver<EngineCommand>,
        events: broadcast::Sender<PeerEvent>,
        config: EngineConfig,
    ) -> Self {
        let scratch = vec![0u8; config.read_chunk_size.max(1)];
        Self {
            poll,
            listener,
            registry: ConnectionRegistry::new(),
            pending_connects: HashMap::new(),
            closing: HashMap::new(),
            receiver,
            events,
            config,
            scratch,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        }
    }

    /// Runs until shutdown completes or every handle is dropped.
    pub(crate) fn run(mut self) {
        info!("Engine loop starting");
        let mut events = Events::with_capacity(self.config.poll_capacity.max(1));

        loop {
            self.process_commands();
            self.expire_deadlines();

            if self.shutting_down && self.registry.is_empty() {
                break;
            }

            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed, stopping engine");
                break;
            }

            for event in events.iter() {
                self.handle_event(event);
            }
        }

        self.close_everything();
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("Engine loop stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn process_commands(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.shutting_down {
                        debug!("All engine handles dropped");
                        self.begin_shutdown(None);
                    }
                    break;
                }
            }
        }
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Connect { addr, respond_to } => {
                self.handle_connect(addr, respond_to);
            }
            EngineCommand::Lookup { id, respond_to } => {
                let _ = respond_to.send(self.handle_lookup(id));
            }
            EngineCommand::List { respond_to } => {
                let _ = respond_to.send(self.registry.list_all());
            }
            EngineCommand::Send {
                id,
                text,
                respond_to,
            } => {
                self.handle_send(id, text, respond_to);
            }
            EngineCommand::Terminate { id, respond_to } => {
                self.handle_terminate(id, respond_to);
            }
            EngineCommand::Shutdown { respond_to } => {
                self.begin_shutdown(Some(respond_to));
            }
        }
    }

    fn handle_connect(
        &mut self,
        addr: SocketAddr,
        respond_to: oneshot::Sender<Result<PeerInfo, EngineError>>,
    ) {
        if self.shutting_down {
            let _ = respond_to.send(Err(EngineError::ShuttingDown));
            return;
        }

        let mut stream = match socket::connect_async(addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %addr, error = %e, "Connect failed immediately");
                let _ = respond_to.send(Err(EngineError::ConnectFailure {
                    addr,
                    reason: e.to_string(),
                }));
                return;
            }
        };

        let id = self.registry.allocate_id();
        if let Err(e) = self.register_stream(id, &mut stream) {
            let _ = respond_to.send(Err(EngineError::ConnectFailure {
                addr,
                reason: e.to_string(),
            }));
            return;
        }
        if let Err(e) = self
            .registry
            .insert(PeerConnection::outbound(id, addr, stream))
        {
            let _ = respond_to.send(Err(e));
            return;
        }

        debug!(id = %id, peer = %addr, "Connect in progress");
        self.pending_connects.insert(
            id,
            PendingConnect {
                addr,
                respond_to,
                deadline: Instant::now() + self.config.connect_timeout,
            },
        );
    }

    fn handle_lookup(&self, id: ConnectionId) -> Result<PeerInfo, EngineError> {
        let peer = self.registry.lookup(id)?;
        if peer.state() != LifecycleState::Established {
            return Err(EngineError::NotFound(id));
        }
        Ok(peer.info())
    }

    fn handle_send(
        &mut self,
        id: ConnectionId,
        text: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    ) {
        let result = self.registry.enqueue_outbound(id, Outbound::Message(text));
        let queued = result.is_ok();
        let _ = respond_to.send(result);
        if queued {
            self.flush_now(id);
        }
    }

    fn handle_terminate(
        &mut self,
        id: ConnectionId,
        respond_to: oneshot::Sender<Result<PeerInfo, EngineError>>,
    ) {
        if !self.start_close(id, Some(respond_to)) {
            return;
        }
        info!(id = %id, "Terminating connection");
        self.flush_now(id);
    }

    /// Moves an established connection to `Closing` with the sentinel queued.
    ///
    /// Answers `respond_to` with `NotFound` and returns false otherwise.
    fn start_close(
        &mut self,
        id: ConnectionId,
        respond_to: Option<oneshot::Sender<Result<PeerInfo, EngineError>>>,
    ) -> bool {
        let started = self
            .registry
            .lookup_mut(id)
            .map(PeerConnection::begin_close)
            .unwrap_or(false);

        if !started {
            if let Some(tx) = respond_to {
                let _ = tx.send(Err(EngineError::NotFound(id)));
            }
            return false;
        }

        self.closing.insert(
            id,
            ClosingState {
                respond_to,
                deadline: Instant::now() + self.config.flush_delay,
            },
        );
        true
    }

    fn begin_shutdown(&mut self, waiter: Option<oneshot::Sender<()>>) {
        if let Some(waiter) = waiter {
            self.shutdown_waiters.push(waiter);
        }
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(connections = self.registry.len(), "Engine shutting down");

        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                debug!(error = %e, "Failed to deregister listener");
            }
        }

        let pending: Vec<ConnectionId> = self.pending_connects.keys().copied().collect();
        for id in pending {
            self.abort_connect(id, EngineError::ShuttingDown);
        }

        for id in self.registry.ids_in(LifecycleState::Established) {
            if self.start_close(id, None) {
                self.flush_now(id);
            }
        }
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    fn handle_event(&mut self, event: &Event) {
        match event.token() {
            WAKER_TOKEN => {
                // Commands are drained at the top of every iteration.
            }
            LISTENER_TOKEN => self.accept_pending(),
            token => {
                let id = id_for(token);
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_error();
                if self.pending_connects.contains_key(&id) {
                    self.resolve_connect(id, readable, writable);
                } else {
                    self.service(id, readable, writable);
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match socket::accept_pending(listener) {
                Ok(Some((stream, remote))) => self.admit(stream, remote),
                Ok(None) => return,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(error = %e, "Incoming connection went away before accept");
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, remote: SocketAddr) {
        let id = self.registry.allocate_id();
        if let Err(e) = self.register_stream(id, &mut stream) {
            warn!(peer = %remote, error = %e, "Failed to register accepted connection");
            return;
        }

        let peer = PeerConnection::inbound(id, remote, stream);
        let info = peer.info();
        if let Err(e) = self.registry.insert(peer) {
            warn!(peer = %remote, error = %e, "Failed to register accepted connection");
            return;
        }

        info!(id = %id, peer = %remote, "Accepted connection");
        self.publish(PeerEvent::Connected { peer: info });
    }

    fn resolve_connect(&mut self, id: ConnectionId, readable: bool, writable: bool) {
        let status = match self.registry.lookup_mut(id) {
            Ok(peer) => peer.complete_connect(),
            Err(_) => {
                self.pending_connects.remove(&id);
                return;
            }
        };

        match status {
            ConnectStatus::InProgress => {
                trace!(id = %id, "Connect still in progress");
            }
            ConnectStatus::Failed(e) => {
                let reason = e.to_string();
                if let Some(addr) = self.pending_connects.get(&id).map(|p| p.addr) {
                    self.abort_connect(id, EngineError::ConnectFailure { addr, reason });
                }
            }
            ConnectStatus::Connected => {
                let Some(pending) = self.pending_connects.remove(&id) else {
                    return;
                };
                let Ok(info) = self.registry.lookup(id).map(PeerConnection::info) else {
                    return;
                };
                info!(id = %id, peer = %pending.addr, "Connection established");
                let _ = pending.respond_to.send(Ok(info.clone()));
                self.publish(PeerEvent::Connected { peer: info });
                self.service(id, readable, writable);
            }
        }
    }

    /// Reads and writes one connection, then tears it down if it ended.
    fn service(&mut self, id: ConnectionId, readable: bool, writable: bool) {
        let Ok(peer) = self.registry.lookup_mut(id) else {
            return;
        };
        let from = peer.remote();

        let mut messages = Vec::new();
        let mut closed = None;

        if readable {
            match peer.receive(&mut self.scratch) {
                Ok(received) => {
                    messages = received.messages;
                    closed = received.closed;
                }
                Err(e) => closed = Some(DisconnectReason::Error(e)),
            }
        }
        let mut flushed = None;
        if closed.is_none() && writable {
            match peer.flush() {
                Ok(state) => flushed = Some(state),
                Err(e) => closed = Some(DisconnectReason::Error(e)),
            }
        }

        for text in messages {
            self.publish(PeerEvent::Message { id, from, text });
        }

        if let Some(reason) = closed {
            self.teardown(id, self.local_reason(id, reason));
        } else if let Some(state) = flushed {
            self.settle_flush(id, Ok(state));
        }
    }

    /// Writes what the socket takes right now.
    ///
    /// Returns `None` if the connection is gone, including when the write
    /// failed and it was torn down.
    fn flush_now(&mut self, id: ConnectionId) -> Option<Flushed> {
        let result = self.registry.lookup_mut(id).ok()?.flush();
        self.settle_flush(id, result)
    }

    fn settle_flush(
        &mut self,
        id: ConnectionId,
        result: Result<Flushed, EngineError>,
    ) -> Option<Flushed> {
        match result {
            Ok(Flushed::SentinelSent) => {
                let remaining = self
                    .closing
                    .get(&id)
                    .map(|state| state.deadline.saturating_duration_since(Instant::now()));
                debug!(id = %id, ?remaining, "Sentinel flushed, waiting for peer to close");
                Some(Flushed::SentinelSent)
            }
            Ok(state) => Some(state),
            Err(e) => {
                self.teardown(id, self.local_reason(id, DisconnectReason::Error(e)));
                None
            }
        }
    }

    /// A connection we are closing ends as a local termination, whatever
    /// the socket reported last.
    fn local_reason(&self, id: ConnectionId, reason: DisconnectReason) -> DisconnectReason {
        if self.closing.contains_key(&id) {
            DisconnectReason::LocalTerminate
        } else {
            reason
        }
    }

    // ========================================================================
    // Teardown and deadlines
    // ========================================================================

    /// Releases a connection. Safe to call for ids already gone.
    fn teardown(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Ok(mut peer) = self.registry.remove(id) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(peer.stream_mut()) {
            debug!(id = %id, error = %e, "Failed to deregister connection");
        }
        peer.mark_closed();
        let info = peer.info();
        drop(peer);

        match &reason {
            DisconnectReason::Error(e) => {
                warn!(id = %id, peer = %info.remote, error = %e, "Connection failed");
            }
            _ => {
                info!(id = %id, peer = %info.remote, reason = %reason, "Connection closed");
            }
        }

        if let Some(tx) = self.closing.remove(&id).and_then(|state| state.respond_to) {
            let _ = tx.send(Ok(info.clone()));
        }
        self.publish(PeerEvent::Disconnected { peer: info, reason });
    }

    /// Drops an outbound connect that never became established.
    fn abort_connect(&mut self, id: ConnectionId, err: EngineError) {
        let Some(pending) = self.pending_connects.remove(&id) else {
            return;
        };
        if let Ok(mut peer) = self.registry.remove(id) {
            if let Err(e) = self.poll.registry().deregister(peer.stream_mut()) {
                debug!(id = %id, error = %e, "Failed to deregister connection");
            }
            peer.mark_closed();
        }
        warn!(id = %id, peer = %pending.addr, error = %err, "Connect failed");
        let _ = pending.respond_to.send(Err(err));
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();

        let timed_out: Vec<(ConnectionId, SocketAddr)> = self
            .pending_connects
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, pending)| (*id, pending.addr))
            .collect();
        for (id, addr) in timed_out {
            self.abort_connect(
                id,
                EngineError::ConnectFailure {
                    addr,
                    reason: "connection timed out".to_string(),
                },
            );
        }

        let flushed: Vec<ConnectionId> = self
            .closing
            .iter()
            .filter(|(_, state)| state.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in flushed {
            debug!(id = %id, "Flush delay elapsed");
            self.teardown(id, DisconnectReason::LocalTerminate);
        }
    }

    /// Time until the nearest deadline, or `None` to wait indefinitely.
    fn next_timeout(&self) -> Option<Duration> {
        let nearest = self
            .pending_connects
            .values()
            .map(|pending| pending.deadline)
            .chain(self.closing.values().map(|state| state.deadline))
            .min()?;
        Some(nearest.saturating_duration_since(Instant::now()))
    }

    /// Releases everything still owned when the loop exits.
    fn close_everything(&mut self) {
        let pending: Vec<ConnectionId> = self.pending_connects.keys().copied().collect();
        for id in pending {
            self.abort_connect(id, EngineError::ShuttingDown);
        }
        for id in self.registry.ids() {
            self.teardown(id, DisconnectReason::LocalTerminate);
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn register_stream(&self, id: ConnectionId, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().register(
            stream,
            token_for(id),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    fn publish(&self, event: PeerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
