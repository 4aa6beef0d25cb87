//! Reply construction.
//!
//! Every chunk read from a client becomes one reply: the chunk with a single
//! trailing newline removed, followed by the configured suffix and a newline.

use bytes::{BufMut, BytesMut};

/// Suffix appended when none is configured.
pub const DEFAULT_SUFFIX: &str = " Received";

const LINE_TERMINATOR: u8 = b'\n';

/// Stateless chunk-to-reply transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Suffix bytes including the trailing newline.
    suffix: Vec<u8>,
}

impl Transform {
    /// Create a transform appending `suffix` followed by a newline.
    pub fn new(suffix: &str) -> Self {
        let mut bytes = Vec::with_capacity(suffix.len() + 1);
        bytes.extend_from_slice(suffix.as_bytes());
        bytes.push(LINE_TERMINATOR);
        Self { suffix: bytes }
    }

    /// Length of the suffix, newline included.
    pub fn suffix_len(&self) -> usize {
        self.suffix.len()
    }

    /// Build the reply for one chunk.
    pub fn apply(&self, chunk: &[u8]) -> BytesMut {
        let body = match chunk.split_last() {
            Some((&LINE_TERMINATOR, rest)) => rest,
            _ => chunk,
        };

        let mut reply = BytesMut::with_capacity(body.len() + self.suffix_len());
        reply.put_slice(body);
        reply.put_slice(&self.suffix);
        reply
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(DEFAULT_SUFFIX)
    }
}
