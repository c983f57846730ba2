//! An owned, fixed-capacity byte buffer for payloads reassembled across
//! several frames (RPCACP call/response bodies, PSACP publications, BWACP
//! block contents). No heap allocation: every instance is as large as the
//! worst case the stuffing layer can ever decode.

use crate::error::Error;
use crate::stuffing::MAX_STUFFED_LEN;

/// Upper bound on a reassembled payload: unstuffed bytes are never more
/// numerous than the stuffed form that carried them.
pub const MAX_PAYLOAD_LEN: usize = MAX_STUFFED_LEN;

/// A reassembled application payload.
#[derive(Clone)]
pub struct Payload {
    buf: [u8; MAX_PAYLOAD_LEN],
    len: usize,
}

impl Payload {
    pub(crate) fn from_slice(data: &[u8]) -> Result<Self, Error> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(Error::BufferTooSmall);
        }
        let mut buf = [0u8; MAX_PAYLOAD_LEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            buf,
            len: data.len(),
        })
    }

    /// The reassembled bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Number of reassembled bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl core::fmt::Debug for Payload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.len)
            .field("bytes", &self.as_slice())
            .finish()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Payload {}
