//! Byte stuffing: a length-prefixed, self-framing encoding used everywhere a
//! variable-length payload has to ride inside a fixed-layout CAN data field.
//!
//! The encoded form is a sequence of `(count, count raw bytes)` blocks
//! terminated by the sentinel `0xFF`. `count` is never `0`; a `0x00` count
//! byte on ingress is an encoder/transmission error (`Error::InvalidStuffing`),
//! never a valid block. An empty input encodes to the single byte `[0xFF]`.
//!
//! ```text
//! stuff(&[])            == [0xFF]
//! stuff(&[0xAA])         == [0x01, 0xAA, 0xFF]
//! stuff(&[0xDE,0xAD,0xBE,0xEF]) == [0x04, 0xDE, 0xAD, 0xBE, 0xEF, 0xFF]
//! ```

use crate::error::Error;

/// Sentinel count byte that terminates a stuffed sequence.
pub const TERMINATOR: u8 = 0xFF;

/// Count byte value that is never valid; seeing it on ingress is an error.
pub const ERROR_MARKER: u8 = 0x00;

/// Largest run of raw bytes a single block may carry (the encoder emits a
/// block boundary at least this often).
pub const MAX_BLOCK_LEN: usize = 254;

/// Upper bound on a *stuffed* payload, across all protocol layers.
pub const MAX_STUFFED_LEN: usize = 2048;

/// Worst-case stuffed length for an input of `input_len` raw bytes: one
/// count byte per `MAX_BLOCK_LEN`-sized run, plus the terminator.
#[must_use]
pub const fn stuffed_len_upper_bound(input_len: usize) -> usize {
    let blocks = input_len.div_ceil(MAX_BLOCK_LEN).max(1) - if input_len == 0 { 1 } else { 0 };
    input_len + blocks + 1
}

/// Encode `input` into `out`, returning the number of bytes written.
///
/// Fails with [`Error::BufferTooSmall`] if `out` cannot hold the encoding, or
/// if `input` is longer than [`MAX_STUFFED_LEN`] could ever represent.
pub fn stuff(input: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if stuffed_len_upper_bound(input.len()) > MAX_STUFFED_LEN {
        return Err(Error::BufferTooSmall);
    }

    let mut pos = 0usize;
    let mut remaining = input;

    while !remaining.is_empty() {
        let chunk_len = remaining.len().min(MAX_BLOCK_LEN);
        let (chunk, rest) = remaining.split_at(chunk_len);

        if pos + 1 + chunk_len > out.len() {
            return Err(Error::BufferTooSmall);
        }
        out[pos] = chunk_len as u8;
        pos += 1;
        out[pos..pos + chunk_len].copy_from_slice(chunk);
        pos += chunk_len;

        remaining = rest;
    }

    if pos >= out.len() {
        return Err(Error::BufferTooSmall);
    }
    out[pos] = TERMINATOR;
    pos += 1;

    Ok(pos)
}

/// Decode a stuffed sequence from `input`, writing the raw bytes into `out`
/// and returning how many were written.
///
/// Fails with [`Error::InvalidStuffing`] if a `0x00` count byte appears, or
/// if an announced run would read past the end of `input` without first
/// seeing the terminator. Fails with [`Error::BufferTooSmall`] if `out`
/// cannot hold the decoded bytes.
pub fn unstuff(input: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let mut in_pos = 0usize;
    let mut out_pos = 0usize;

    loop {
        let count = *input.get(in_pos).ok_or(Error::InvalidStuffing)?;
        in_pos += 1;

        if count == TERMINATOR {
            return Ok(out_pos);
        }
        if count == ERROR_MARKER {
            return Err(Error::InvalidStuffing);
        }

        let count = count as usize;
        let chunk = input
            .get(in_pos..in_pos + count)
            .ok_or(Error::InvalidStuffing)?;
        in_pos += count;

        if out_pos + count > out.len() {
            return Err(Error::BufferTooSmall);
        }
        out[out_pos..out_pos + count].copy_from_slice(chunk);
        out_pos += count;
    }
}

/// Outcome of [`unstuff_streaming`]: unlike [`unstuff`], running off the end
/// of `input` mid-block is not itself an error — more continuation frames
/// may still be on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnstuffOutcome {
    /// The terminator was found; `.0` is the number of raw bytes written.
    Complete(usize),
    /// `input` ended mid-count or mid-block; more bytes are needed before
    /// this can be decided either way.
    Incomplete,
    /// A `0x00` count byte appeared, or the decoded bytes would not fit in
    /// `out` — a real error regardless of how much more might arrive.
    Invalid,
}

/// Like [`unstuff`], but for a multi-frame reassembly loop that appends
/// incoming bytes to `input` one frame at a time and re-tries: an `input`
/// that runs out before a count byte's announced run completes reports
/// [`UnstuffOutcome::Incomplete`] instead of [`Error::InvalidStuffing`].
#[must_use]
pub fn unstuff_streaming(input: &[u8], out: &mut [u8]) -> UnstuffOutcome {
    let mut in_pos = 0usize;
    let mut out_pos = 0usize;

    loop {
        let Some(&count) = input.get(in_pos) else {
            return UnstuffOutcome::Incomplete;
        };
        in_pos += 1;

        if count == TERMINATOR {
            return UnstuffOutcome::Complete(out_pos);
        }
        if count == ERROR_MARKER {
            return UnstuffOutcome::Invalid;
        }

        let count = count as usize;
        let Some(chunk) = input.get(in_pos..in_pos + count) else {
            return UnstuffOutcome::Incomplete;
        };
        in_pos += count;

        if out_pos + count > out.len() {
            return UnstuffOutcome::Invalid;
        }
        out[out_pos..out_pos + count].copy_from_slice(chunk);
        out_pos += count;
    }
}

/// Convenience wrapper returning an owned fixed-capacity buffer instead of
/// writing through a caller-provided slice. Used by protocol layers that
/// just need a scratch stuffed form to slice frames out of.
pub struct StuffedBuf {
    buf: [u8; MAX_STUFFED_LEN],
    len: usize,
}

impl StuffedBuf {
    /// Stuff `input` into a fresh fixed-capacity buffer.
    pub fn new(input: &[u8]) -> Result<Self, Error> {
        let mut buf = [0u8; MAX_STUFFED_LEN];
        let len = stuff(input, &mut buf)?;
        Ok(Self { buf, len })
    }

    /// The stuffed bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Number of stuffed bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the stuffed form is empty. Never true: even `stuff(&[])`
    /// produces the one-byte terminator.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
