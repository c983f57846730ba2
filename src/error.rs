//! Closed error taxonomy shared by every layer of the stack.
//!
//! Nothing in this crate panics, aborts, or swallows an error. Every fallible
//! operation returns one of these variants (often wrapped in [`nb::Result`]
//! at the backend boundary, where `WouldBlock` stands in for
//! [`Error::Backpressure`] on send and a pending/empty condition on receive).

use core::fmt;

/// The single error type returned by every public operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Address out of range, forbidden broadcast, payload too large, unknown
    /// backend kind.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Encoding would exceed a fixed-size buffer.
    #[error("buffer too small")]
    BufferTooSmall,

    /// A byte-stuffed sequence was malformed on ingress.
    #[error("invalid byte stuffing")]
    InvalidStuffing,

    /// A CRC over a received payload did not match.
    #[error("CRC mismatch")]
    CrcMismatch,

    /// A frame failed structural validation (bad protocol bits, wrong DLC, ...).
    #[error("invalid frame")]
    InvalidFrame,

    /// `receive` or an ACK/response wait expired before a matching frame arrived.
    #[error("timeout")]
    Timeout,

    /// The transport cannot accept another frame right now; transient.
    #[error("backpressure")]
    Backpressure,

    /// The backend has not been opened, or was already closed.
    #[error("backend not open")]
    NotOpen,

    /// The backend transport failed in a way the context cannot recover from.
    #[error("transport fault: {0}")]
    TransportFault(TransportFault),

    /// A frame was received whose protocol class did not match the layer
    /// that asked for it.
    #[error("protocol mismatch")]
    ProtocolMismatch,

    /// An RPC peer explicitly refused the call; carries the wire NACK code.
    #[error("nack received: {0:#04x}")]
    NackReceived(u8),

    /// A bounded reassembly table (PSACP/BWACP) has no free slot for a new
    /// (sender, topic/target) stream.
    #[error("too many concurrent reassembly streams")]
    TooManyStreams,
}

/// The cause of a [`Error::TransportFault`], kept distinct from `Error` so
/// backend modules can report it without pulling every backend's error type
/// into the crate-wide enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    /// The underlying OS socket/fd/bus reported an unrecoverable error.
    Io,
    /// A TCP tunnel peer sent a length prefix that did not match the fixed
    /// frame encoding size; the stream is considered corrupted.
    FramingDesync,
    /// No route to the configured interface/host (bind or connect failed).
    NoRoute,
    /// The SPI-controller backend is a stub and cannot perform this operation.
    NotImplemented,
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFault::Io => write!(f, "I/O error"),
            TransportFault::FramingDesync => write!(f, "length-prefix framing desync"),
            TransportFault::NoRoute => write!(f, "no route to transport"),
            TransportFault::NotImplemented => write!(f, "not implemented"),
        }
    }
}

/// Convert a `nb::Error<Error>` (the shape every backend operation returns)
/// into a plain [`Error`], collapsing `WouldBlock` into the caller-meaningful
/// variant. Protocol layers use this once they've decided a `WouldBlock` is
/// actually a timeout (i.e. their own deadline, not the backend's, expired).
pub(crate) fn timeout_on_would_block(e: nb::Error<Error>) -> Error {
    match e {
        nb::Error::WouldBlock => Error::Timeout,
        nb::Error::Other(e) => e,
    }
}

/// Like [`timeout_on_would_block`], but for the `send` side of the backend
/// contract, where an unconsumed `WouldBlock` means the transport is not
/// ready to accept a frame right now, not that a deadline elapsed.
pub(crate) fn backpressure_on_would_block(e: nb::Error<Error>) -> Error {
    match e {
        nb::Error::WouldBlock => Error::Backpressure,
        nb::Error::Other(e) => e,
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::TransportFault(TransportFault::Io)
    }
}
