//! The SPI CAN-controller backend.
//!
//! Drives an external CAN-controller chip (the register layout below follows
//! the common MCP2515-style command set) over SPI, with receive driven by
//! polling an interrupt pin rather than a kernel-provided socket. This is
//! the stub backend in the source budget: the register/command surface is
//! real, but the actual bus timing (CS assertion windows, inter-byte
//! delays) is hardware-specific and left to the `SpiHandle` implementation
//! the caller supplies, so this module introduces no dependency on any
//! particular SPI peripheral HAL.

use super::Backend;
use crate::error::{Error, TransportFault};
use crate::frame::Frame;

/// SPI command bytes for a typical external CAN controller.
mod command {
    pub const RESET: u8 = 0xC0;
    pub const READ: u8 = 0x03;
    pub const WRITE: u8 = 0x02;
    pub const READ_STATUS: u8 = 0xA0;
    pub const RTS_TXB0: u8 = 0x81;
}

/// Register addresses referenced by this backend.
mod register {
    pub const CANSTAT: u8 = 0x0E;
    pub const CANINTF: u8 = 0x2C;
    pub const TXB0SIDH: u8 = 0x31;
    pub const RXB0SIDH: u8 = 0x61;
}

/// Interrupt-flag bit indicating a frame is waiting in receive buffer 0.
const CANINTF_RX0IF: u8 = 0x01;

/// Caller-supplied SPI transport plus the one GPIO read the receive path
/// needs to detect a pending frame without a kernel-mediated interrupt.
///
/// No concrete HAL is referenced here; implementers wire this to
/// `embedded-hal`'s `SpiDevice`/`InputPin` (or an OS-level SPI device file)
/// however their platform requires.
pub trait SpiHandle {
    /// Full-duplex SPI transfer: `write` goes out, `read` is filled with
    /// whatever comes back, one byte per byte of `write`. `read` and `write`
    /// are always the same length.
    fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), Error>;

    /// Poll-read the controller's interrupt pin. `true` means at least one
    /// interrupt condition (here, always treated as "frame received") is
    /// asserted.
    fn interrupt_pending(&mut self) -> bool;
}

/// The SPI CAN-controller backend (§4.6).
pub struct SpiCanController<H: SpiHandle> {
    handle: H,
    open: bool,
}

impl<H: SpiHandle> SpiCanController<H> {
    /// Wrap a caller-provided SPI handle. Call [`Backend::init`] before use.
    #[must_use]
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            open: false,
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) -> Result<(), Error> {
        let write = [command::WRITE, reg, value];
        let mut read = [0u8; 3];
        self.handle.transfer(&write, &mut read)
    }

    fn read_register(&mut self, reg: u8) -> Result<u8, Error> {
        let write = [command::READ, reg, 0x00];
        let mut read = [0u8; 3];
        self.handle.transfer(&write, &mut read)?;
        Ok(read[2])
    }
}

impl<H: SpiHandle> Backend for SpiCanController<H> {
    fn init(&mut self) -> Result<(), Error> {
        let mut read = [0u8; 1];
        self.handle.transfer(&[command::RESET], &mut read)?;

        // A reset controller reports configuration mode on CANSTAT; confirm
        // the chip is actually responding rather than assuming success.
        let status = self.read_register(register::CANSTAT)?;
        if status == 0xFF {
            // All-ones usually means "nothing answered" (MISO stuck high).
            log::error!("SPI CAN controller did not respond on CANSTAT readback");
            return Err(Error::TransportFault(TransportFault::NoRoute));
        }

        self.open = true;
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> nb::Result<(), Error> {
        if !self.open {
            return Err(nb::Error::Other(Error::NotOpen));
        }

        let id = frame.id();
        let sidh = (id >> 21) as u8;
        let sidl = (((id >> 18) & 0x07) as u8) << 5 | 0x08 | (((id >> 16) & 0x03) as u8);
        let eid8 = (id >> 8) as u8;
        let eid0 = id as u8;

        let mut write = [0u8; 3 + 5 + 8];
        write[0] = command::WRITE;
        write[1] = register::TXB0SIDH;
        write[2] = sidh;
        // Remaining header bytes (SIDL, EID8, EID0, DLC) plus up to 8 data
        // bytes are written in the same burst per the controller's
        // sequential-write mode.
        write[3] = sidl;
        write[4] = eid8;
        write[5] = eid0;
        write[6] = frame.dlc();
        write[7..7 + frame.data().len()].copy_from_slice(frame.data());

        let total = 7 + frame.data().len();
        let mut read = [0u8; 3 + 5 + 8];
        self.handle
            .transfer(&write[..total], &mut read[..total])
            .map_err(nb::Error::Other)?;

        self.handle
            .transfer(&[command::RTS_TXB0], &mut [0u8; 1])
            .map_err(nb::Error::Other)?;

        log::trace!("spi backend egress id={:#010x} dlc={}", frame.id(), frame.dlc());
        Ok(())
    }

    fn receive(&mut self, timeout_ms: u32) -> nb::Result<Frame, Error> {
        if !self.open {
            return Err(nb::Error::Other(Error::NotOpen));
        }

        if !self.handle.interrupt_pending() {
            if timeout_ms == 0 {
                return Err(nb::Error::WouldBlock);
            }
            // A real port busy-polls `interrupt_pending` with a HAL delay
            // between iterations until `timeout_ms` elapses; this backend
            // has no portable delay source of its own, so it reports the
            // single poll's outcome and leaves pacing to the caller's loop.
            return Err(nb::Error::Other(Error::Timeout));
        }

        let mut header = [0u8; 5];
        {
            let write = [command::READ, register::RXB0SIDH, 0, 0, 0, 0, 0];
            let mut read = [0u8; 7];
            self.handle
                .transfer(&write, &mut read)
                .map_err(nb::Error::Other)?;
            header.copy_from_slice(&read[2..7]);
        }

        let sidh = header[0] as u32;
        let sidl = header[1];
        let eid8 = header[2] as u32;
        let eid0 = header[3] as u32;
        let dlc = header[4] & 0x0F;

        let id = (sidh << 21)
            | (((sidl >> 5) as u32) << 18)
            | (((sidl & 0x03) as u32) << 16)
            | (eid8 << 8)
            | eid0;

        let mut data = [0u8; 8];
        {
            let write = [command::READ, register::RXB0SIDH + 5, 0, 0, 0, 0, 0, 0, 0, 0];
            let mut read = [0u8; 10];
            self.handle
                .transfer(&write, &mut read)
                .map_err(nb::Error::Other)?;
            data.copy_from_slice(&read[2..10]);
        }

        self.write_register(register::CANINTF, !CANINTF_RX0IF)
            .map_err(nb::Error::Other)?;

        let frame = Frame::new(id, &data[..dlc as usize]).map_err(nb::Error::Other)?;
        log::trace!("spi backend ingress id={:#010x} dlc={}", frame.id(), frame.dlc());
        Ok(frame)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.open = false;
        Ok(())
    }
}
