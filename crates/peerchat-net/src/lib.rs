//! Peerchat connection engine
//!
//! This crate provides the networking core of a peerchat endpoint:
//! - `socket` - Non-blocking socket primitives (listen, accept, connect, read, write)
//! - `registry` - Connection registry owning every peer connection
//! - `engine` - Readiness loop, per-connection state machine and the handle
//!   the console uses to drive it
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     peerchat process                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐  EngineCommand  ┌────────────────────┐  │
//! │  │  EngineHandle   │────────────────▶│     EventLoop      │  │
//! │  │ (console side)  │  mpsc + Waker   │ (engine thread)    │  │
//! │  └────────▲────────┘                 │  mio::Poll         │  │
//! │           │                          │  TcpListener       │  │
//! │           │ PeerEvent                │  ConnectionRegistry│  │
//! │           │ (broadcast)              └─────────┬──────────┘  │
//! │           └────────────────────────────────────┘             │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the engine thread touches sockets or the registry. Everything else
//! goes through the handle.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Socket errors tear down the affected connection, never the loop

pub mod engine;
pub mod registry;
pub mod socket;

pub use engine::{
    spawn_engine, DisconnectReason, EngineConfig, EngineError, EngineHandle, ListenerStatus,
    PeerEvent,
};
pub use registry::{ConnectionRegistry, PeerConnection};
