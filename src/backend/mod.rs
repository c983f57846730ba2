//! The backend abstraction: everything the protocol layers need from a
//! transport, and nothing else.
//!
//! A [`Backend`] is deliberately thin — `init`/`send`/`receive`/`close` over
//! an opaque, owned state object — so the same protocol-layer code runs
//! unmodified against a kernel CAN socket, a bare-metal SPI controller, an
//! in-process mock, or a TCP-tunneled mock. `send`/`receive` follow the `nb`
//! convention: `Err(nb::Error::WouldBlock)` means "try again", never a fatal
//! condition.

pub mod queue;
pub mod spi;

#[cfg(feature = "tcp-backend")]
pub mod tcp;

#[cfg(feature = "socketcan-backend")]
pub mod can_socket;

use crate::error::Error;
use crate::frame::Frame;

/// The transport contract every backend implements.
///
/// Implementations own a fixed-layout state object (a queue, a socket, an
/// SPI handle) rather than reaching into a process-wide global, so that
/// multiple [`crate::context::Context`]s can coexist in one process without
/// sharing state unless the caller explicitly wires them together.
pub trait Backend {
    /// Prepare the transport. May fail with `NoRoute`/bind-style errors.
    /// Calling `init` twice without an intervening `close` is not
    /// guaranteed to be idempotent; implementations may return whatever
    /// error the second `init` attempt produces on the underlying resource.
    fn init(&mut self) -> Result<(), Error>;

    /// Hand one frame to the transport.
    ///
    /// `Err(nb::Error::WouldBlock)` means the transport cannot accept a
    /// frame *right now* (backpressure) — never queue internally, report it.
    /// `Err(nb::Error::Other(_))` is fatal; the context should be treated as
    /// closed.
    fn send(&mut self, frame: &Frame) -> nb::Result<(), Error>;

    /// Wait up to `timeout_ms` for a frame. `timeout_ms == 0` means
    /// non-blocking: return immediately with `Err(nb::Error::WouldBlock)` if
    /// nothing is available.
    ///
    /// On a positive timeout that elapses with nothing received,
    /// implementations return `Err(nb::Error::Other(Error::Timeout))` —
    /// the deadline, unlike "nothing right now", is not a `WouldBlock`
    /// condition because the caller asked for a bounded wait and it is over.
    fn receive(&mut self, timeout_ms: u32) -> nb::Result<Frame, Error>;

    /// Release backend resources. Idempotent: calling `close` on an already
    /// closed backend is a no-op, not an error. Every operation after
    /// `close` fails with [`Error::NotOpen`].
    fn close(&mut self) -> Result<(), Error>;
}

/// Which concrete backend a [`crate::context::Context`] should construct and
/// own, per the semantic backend-selection API in the external interfaces
/// section of the spec.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// The kernel SocketCAN interface (Linux only).
    #[cfg(feature = "socketcan-backend")]
    NativeCan {
        /// Interface name, e.g. `"can0"`.
        interface: heapless::String<16>,
    },
    /// The SPI CAN-controller stub.
    SpiController,
    /// The in-process bounded-ring mock, for deterministic unit tests.
    LocalQueue,
    /// The length-prefixed TCP tunnel mock, for multi-container integration
    /// tests.
    #[cfg(feature = "tcp-backend")]
    TcpTunnel(tcp::TcpConfig),
}
