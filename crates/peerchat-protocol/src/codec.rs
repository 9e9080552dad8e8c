//! Codec between a connection's byte accumulator and protocol payloads.
//!
//! There is no framing on the wire, so decoding works on whatever the
//! engine has accumulated after a read event:
//!
//! - bytes before a sentinel are one [`Inbound::Message`], the sentinel is
//!   [`Inbound::Terminate`] and anything after it is discarded;
//! - a trailing partial sentinel is held until more bytes arrive;
//! - a trailing incomplete UTF-8 sequence is held as well, any other invalid
//!   UTF-8 is rendered lossily.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::payload::{find_sentinel, partial_sentinel_suffix, Inbound, Outbound};

/// Stateful codec for one peer link.
#[derive(Debug, Default)]
pub struct PayloadCodec {
    /// Set once a sentinel was decoded; later bytes are dropped.
    terminated: bool,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the peer has sent the termination sentinel.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Decoder for PayloadCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.terminated {
            src.clear();
            return Ok(None);
        }
        if src.is_empty() {
            return Ok(None);
        }

        if let Some(pos) = find_sentinel(src) {
            if pos == 0 {
                src.clear();
                self.terminated = true;
                return Ok(Some(Inbound::Terminate));
            }
            let text = src.split_to(pos);
            return Ok(Some(Inbound::Message(render(&text))));
        }

        let held = partial_sentinel_suffix(src);
        let candidate = src.len() - held;
        let end = candidate - incomplete_utf8_suffix(src.get(..candidate).unwrap_or_default());
        if end == 0 {
            return Ok(None);
        }

        let text = src.split_to(end);
        Ok(Some(Inbound::Message(render(&text))))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // Nothing more is coming, so held-back bytes are flushed as text.
        let rest = buf.split();
        Ok(Some(Inbound::Message(render(&rest))))
    }
}

impl Encoder<Outbound> for PayloadCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.into_bytes());
        Ok(())
    }
}

fn render(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Length of a UTF-8 sequence cut off at the end of `bytes`, if any.
fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    for (back, byte) in bytes.iter().rev().take(3).enumerate() {
        let seen = back + 1;
        if byte & 0b1100_0000 == 0b1000_0000 {
            // Continuation byte, keep looking for the lead byte.
            continue;
        }
        let expected = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        return if seen < expected { seen } else { 0 };
    }
    0
}
