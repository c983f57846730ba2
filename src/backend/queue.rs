//! The in-process queue backend: a bounded FIFO ring used for deterministic,
//! single-process unit tests.
//!
//! This is not a loopback in the network sense — the same ring mediates
//! both `send` and `receive`, so a context using this backend observes its
//! own sent frames on the next `receive` call. Tests that want two
//! independent "nodes" talking to each other should construct two
//! `LocalQueueBackend`s and wire `send` on one to `receive` on the other by
//! hand, or use the TCP tunnel backend instead.

use heapless::Deque;

use super::Backend;
use crate::error::Error;
use crate::frame::Frame;

/// Design-constant ring capacity. Not tunable — the in-process backend
/// exists to give unit tests fully deterministic behavior, and a fixed
/// capacity is part of that determinism.
pub const CAPACITY: usize = 32;

/// The in-process queue backend (§4.3).
pub struct LocalQueueBackend {
    ring: Deque<Frame, CAPACITY>,
    open: bool,
}

impl LocalQueueBackend {
    /// Construct a closed backend; call [`Backend::init`] before using it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: Deque::new(),
            open: false,
        }
    }
}

impl Default for LocalQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LocalQueueBackend {
    fn init(&mut self) -> Result<(), Error> {
        self.ring.clear();
        self.open = true;
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> nb::Result<(), Error> {
        if !self.open {
            return Err(nb::Error::Other(Error::NotOpen));
        }
        log::trace!("queue backend egress id={:#010x} dlc={}", frame.id(), frame.dlc());
        self.ring
            .push_back(*frame)
            .map_err(|_| nb::Error::WouldBlock)
    }

    fn receive(&mut self, _timeout_ms: u32) -> nb::Result<Frame, Error> {
        if !self.open {
            return Err(nb::Error::Other(Error::NotOpen));
        }
        // Timeouts are meaningless for this backend: there is no I/O to
        // wait on, so an empty ring is reported immediately regardless of
        // the caller's requested timeout.
        let frame = self.ring.pop_front().ok_or(nb::Error::WouldBlock)?;
        log::trace!("queue backend ingress id={:#010x} dlc={}", frame.id(), frame.dlc());
        Ok(frame)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.ring.clear();
        self.open = false;
        Ok(())
    }
}
