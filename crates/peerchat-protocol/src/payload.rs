//! Payload types exchanged over a peer link.

use bytes::Bytes;

/// Reserved payload that asks the receiving side to close the link.
///
/// NUL cannot be typed at the console, so no chat line can collide with it.
pub const SENTINEL: &[u8] = b"\0TERMINATE\0";

/// Suggested upper bound for a chat message, in characters.
///
/// Advisory only: the console warns above it, the transport never enforces it.
pub const ADVISORY_MESSAGE_LEN: usize = 100;

/// Returns true when `payload` is exactly the termination sentinel.
#[must_use]
pub fn is_sentinel(payload: &[u8]) -> bool {
    payload == SENTINEL
}

/// Offset of the first sentinel in `haystack`.
pub(crate) fn find_sentinel(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(SENTINEL.len())
        .position(|window| window == SENTINEL)
}

/// Length of the longest proper prefix of the sentinel that ends `bytes`.
pub(crate) fn partial_sentinel_suffix(bytes: &[u8]) -> usize {
    (1..SENTINEL.len())
        .rev()
        .find(|&len| {
            SENTINEL
                .get(..len)
                .is_some_and(|prefix| bytes.ends_with(prefix))
        })
        .unwrap_or(0)
}

/// A decoded unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// User-visible chat text.
    Message(String),
    /// The peer asked to close the link.
    Terminate,
}

/// A unit of outbound traffic waiting in a connection's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(String),
    Terminate,
}

impl Outbound {
    /// Wire bytes for this payload.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Message(text) => Bytes::from(text),
            Self::Terminate => Bytes::from_static(SENTINEL),
        }
    }

    /// Whether this payload would be read as a termination request.
    ///
    /// The stream has no framing, so chat text counts as control when it
    /// carries the sentinel anywhere, or ends with the start of one that
    /// the next message could complete.
    #[must_use]
    pub fn is_control(&self) -> bool {
        match self {
            Self::Message(text) => {
                let bytes = text.as_bytes();
                find_sentinel(bytes).is_some() || partial_sentinel_suffix(bytes) > 0
            }
            Self::Terminate => true,
        }
    }
}
