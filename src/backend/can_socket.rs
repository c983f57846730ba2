//! The native SocketCAN backend: talks to a real CAN interface through the
//! Linux kernel's `PF_CAN`/`SOCK_RAW` socket family.
//!
//! Only meaningful on Linux. The type still exists on other platforms so a
//! crate built with the `socketcan-backend` feature compiles everywhere;
//! [`Backend::init`] there simply reports
//! [`TransportFault::NotImplemented`].

use heapless::String as HString;

use super::Backend;
use crate::error::Error;
use crate::frame::Frame;

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    use embedded_can::{ExtendedId, Frame as _};
    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll, Token};
    use socketcan::{CanFrame, CanSocket, Socket};

    use super::HString;
    use crate::backend::Backend;
    use crate::error::{Error, TransportFault};
    use crate::frame::Frame;

    const TOKEN: Token = Token(0);

    fn decode(can_frame: &CanFrame) -> Result<Frame, Error> {
        let raw_id = match can_frame.id() {
            embedded_can::Id::Standard(sid) => u32::from(sid.as_raw()),
            embedded_can::Id::Extended(eid) => eid.as_raw(),
        };
        let frame = Frame::new(raw_id, can_frame.data())?;
        Ok(if can_frame.is_extended() { frame } else { frame.mark_base() })
    }

    /// The kernel SocketCAN backend (§4.5).
    pub struct NativeCanBackend {
        interface: HString<16>,
        socket: Option<CanSocket>,
        poll: Option<Poll>,
        open: bool,
    }

    impl NativeCanBackend {
        /// Target a named interface, e.g. `"can0"` or `"vcan0"`. Call
        /// [`Backend::init`] before using it.
        #[must_use]
        pub fn new(interface: HString<16>) -> Self {
            Self {
                interface,
                socket: None,
                poll: None,
                open: false,
            }
        }
    }

    impl Backend for NativeCanBackend {
        fn init(&mut self) -> Result<(), Error> {
            let socket = CanSocket::open(self.interface.as_str()).map_err(|e| {
                log::error!("failed to open CAN interface {}: {e}", self.interface.as_str());
                Error::TransportFault(TransportFault::NoRoute)
            })?;
            socket
                .set_nonblocking(true)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;

            let poll = Poll::new().map_err(|_| Error::TransportFault(TransportFault::Io))?;
            let fd = socket.as_raw_fd();
            poll.registry()
                .register(&mut SourceFd(&fd), TOKEN, Interest::READABLE)
                .map_err(|_| Error::TransportFault(TransportFault::Io))?;

            self.socket = Some(socket);
            self.poll = Some(poll);
            self.open = true;
            Ok(())
        }

        fn send(&mut self, frame: &Frame) -> nb::Result<(), Error> {
            if !self.open {
                return Err(nb::Error::Other(Error::NotOpen));
            }
            let socket = self.socket.as_ref().ok_or(nb::Error::Other(Error::NotOpen))?;

            let id = ExtendedId::new(frame.id()).ok_or(nb::Error::Other(Error::InvalidFrame))?;
            let can_frame =
                CanFrame::new(id, frame.data()).ok_or(nb::Error::Other(Error::InvalidFrame))?;

            match socket.write_frame(&can_frame) {
                Ok(()) => {
                    log::trace!("can0 backend egress id={:#010x} dlc={}", frame.id(), frame.dlc());
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
                Err(e) => {
                    log::error!("native CAN socket write failed: {e}");
                    Err(nb::Error::Other(Error::TransportFault(TransportFault::Io)))
                }
            }
        }

        fn receive(&mut self, timeout_ms: u32) -> nb::Result<Frame, Error> {
            if !self.open {
                return Err(nb::Error::Other(Error::NotOpen));
            }
            let socket = self.socket.as_ref().ok_or(nb::Error::Other(Error::NotOpen))?;

            match socket.read_frame() {
                Ok(can_frame) => decode(&can_frame).map_err(nb::Error::Other).inspect(|f| {
                    log::trace!("can0 backend ingress id={:#010x} dlc={}", f.id(), f.dlc());
                }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if timeout_ms == 0 {
                        return Err(nb::Error::WouldBlock);
                    }
                    let poll = self.poll.as_mut().ok_or(nb::Error::Other(Error::NotOpen))?;
                    let mut events = Events::with_capacity(1);
                    poll.poll(&mut events, Some(Duration::from_millis(u64::from(timeout_ms))))
                        .map_err(|_| nb::Error::Other(Error::TransportFault(TransportFault::Io)))?;
                    if events.is_empty() {
                        return Err(nb::Error::Other(Error::Timeout));
                    }
                    match socket.read_frame() {
                        Ok(can_frame) => decode(&can_frame).map_err(nb::Error::Other).inspect(|f| {
                            log::trace!("can0 backend ingress id={:#010x} dlc={}", f.id(), f.dlc());
                        }),
                        Err(_) => Err(nb::Error::Other(Error::Timeout)),
                    }
                }
                Err(e) => {
                    log::error!("native CAN socket read failed: {e}");
                    Err(nb::Error::Other(Error::TransportFault(TransportFault::Io)))
                }
            }
        }

        fn close(&mut self) -> Result<(), Error> {
            if let (Some(socket), Some(poll)) = (&self.socket, &self.poll) {
                let fd = socket.as_raw_fd();
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
            }
            self.socket = None;
            self.poll = None;
            self.open = false;
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::NativeCanBackend;

#[cfg(not(target_os = "linux"))]
/// The kernel SocketCAN backend (§4.5). Unavailable outside Linux; every
/// operation fails with [`crate::error::TransportFault::NotImplemented`].
pub struct NativeCanBackend {
    #[allow(dead_code)]
    interface: HString<16>,
}

#[cfg(not(target_os = "linux"))]
impl NativeCanBackend {
    /// Construct a backend that will always fail to initialize, for crates
    /// built with `socketcan-backend` on a non-Linux target.
    #[must_use]
    pub fn new(interface: HString<16>) -> Self {
        Self { interface }
    }
}

#[cfg(not(target_os = "linux"))]
impl Backend for NativeCanBackend {
    fn init(&mut self) -> Result<(), Error> {
        Err(Error::TransportFault(crate::error::TransportFault::NotImplemented))
    }

    fn send(&mut self, _frame: &Frame) -> nb::Result<(), Error> {
        Err(nb::Error::Other(Error::NotOpen))
    }

    fn receive(&mut self, _timeout_ms: u32) -> nb::Result<Frame, Error> {
        Err(nb::Error::Other(Error::NotOpen))
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn init_against_a_nonexistent_interface_fails_with_no_route() {
        let mut interface = HString::<16>::new();
        interface.push_str("artie-test-none").ok();
        let mut backend = NativeCanBackend::new(interface);
        assert!(backend.init().is_err());
    }
}

#[cfg(all(test, not(target_os = "linux")))]
mod tests {
    use super::*;

    #[test]
    fn init_is_not_implemented_off_linux() {
        let mut backend = NativeCanBackend::new(HString::<16>::new());
        assert!(matches!(
            backend.init(),
            Err(Error::TransportFault(crate::error::TransportFault::NotImplemented))
        ));
    }
}
