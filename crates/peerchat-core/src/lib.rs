//! Peerchat Core - Shared types for the peer-to-peer chat endpoint
//!
//! This crate provides the domain types shared between the connection
//! engine (peerchat-net) and the command console (peerchat).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod error;
pub mod port;

// Re-exports for convenience
pub use connection::{ConnectionId, LifecycleState, PeerInfo, Role};
pub use error::{DomainError, DomainResult};
pub use port::{Port, DEFAULT_PORT, MAX_PORT, MIN_PORT};
