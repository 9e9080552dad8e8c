//! Peerchat Protocol - Wire protocol for peer links
//!
//! Peer links carry raw bytes with no length prefix or delimiter. A payload
//! is whatever arrived in one read; one reserved value, the termination
//! sentinel, is a control signal instead of chat text.

pub mod codec;
pub mod payload;

pub use codec::PayloadCodec;
pub use payload::{is_sentinel, Inbound, Outbound, ADVISORY_MESSAGE_LEN, SENTINEL};
