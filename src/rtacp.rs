//! RTACP: unicast/broadcast short messages with an optional ACK.
//!
//! Payload bytes ride verbatim — no byte-stuffing, no CRC beyond what the CAN
//! bus itself already provides at this small a payload size.

use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::context::Context;
use crate::error::{self, Error};
use crate::frame::{Frame, NodeAddress, Priority, ProtocolClass};

const FRAME_KIND_ACK: u32 = 0;
const FRAME_KIND_MSG: u32 = 1;

/// Trailing all-ones field: `proto(3)·kind(1)·priority(2)·sender(6)·target(6)`
/// only sums to 18 bits, so the ten low bits of the 29-bit identifier carry
/// no information and are fixed at all-ones per §3.
const RESERVED_BITS: u32 = 10;
const RESERVED_ONES: u32 = (1 << RESERVED_BITS) - 1;

/// A decoded RTACP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtacpMessage {
    pub is_ack: bool,
    pub priority: Priority,
    pub sender: NodeAddress,
    pub target: NodeAddress,
    payload: [u8; 8],
    payload_len: u8,
}

impl RtacpMessage {
    /// The message payload, `0..=8` bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }
}

fn pack_id(is_ack: bool, priority: Priority, sender: NodeAddress, target: NodeAddress) -> u32 {
    let kind = if is_ack { FRAME_KIND_ACK } else { FRAME_KIND_MSG };
    (u32::from(ProtocolClass::Rtacp.bits()) << 25)
        | (kind << 24)
        | (u32::from(priority.bits()) << 22)
        | (u32::from(sender.value()) << 16)
        | (u32::from(target.value()) << 10)
        | RESERVED_ONES
}

fn unpack(frame: &Frame) -> Option<RtacpMessage> {
    if frame.protocol_class() != Some(ProtocolClass::Rtacp) {
        return None;
    }
    let id = frame.id();
    let is_ack = (id >> 24) & 0b1 == FRAME_KIND_ACK;
    let priority = Priority::from_bits(((id >> 22) & 0b11) as u8);
    let sender = NodeAddress::new(((id >> 16) & 0x3F) as u8).ok()?;
    let target = NodeAddress::new(((id >> 10) & 0x3F) as u8).ok()?;

    let mut payload = [0u8; 8];
    payload[..frame.data().len()].copy_from_slice(frame.data());
    Some(RtacpMessage {
        is_ack,
        priority,
        sender,
        target,
        payload,
        payload_len: frame.dlc(),
    })
}

/// The RTACP layer, borrowed from a [`Context`] for the duration of a call.
pub struct Rtacp<'a, B: Backend> {
    ctx: &'a mut Context<B>,
}

impl<'a, B: Backend> Rtacp<'a, B> {
    pub(crate) fn new(ctx: &'a mut Context<B>) -> Self {
        Self { ctx }
    }

    /// Send a MSG frame. If `target` is not broadcast, `wait_ack` is set, the
    /// frame was accepted by the backend, wait a single 1 ms window for a
    /// matching ACK (sender/target swapped, payload equal); any other
    /// outcome of that single window — a non-matching frame, or nothing at
    /// all — fails the send with [`Error::Timeout`]. There is no retry
    /// within `send` itself; callers that want persistence re-call.
    pub fn send(
        &mut self,
        target: NodeAddress,
        priority: Priority,
        payload: &[u8],
        wait_ack: bool,
    ) -> Result<(), Error> {
        if payload.len() > 8 {
            return Err(Error::InvalidArgument("RTACP payload exceeds 8 bytes"));
        }
        let sender = self.ctx.node_address();
        let id = pack_id(false, priority, sender, target);
        let frame = Frame::new(id, payload)?;
        self.ctx
            .backend_mut()
            .send(&frame)
            .map_err(error::backpressure_on_would_block)?;

        if target.is_broadcast() || !wait_ack {
            return Ok(());
        }

        match self.ctx.backend_mut().receive(1) {
            Ok(incoming) => {
                let matched = unpack(&incoming).is_some_and(|msg| {
                    msg.is_ack
                        && msg.sender == target
                        && msg.target == sender
                        && msg.payload() == payload
                });
                if matched {
                    Ok(())
                } else {
                    log::debug!("rtacp send to {:?} got a frame that was not the expected ack", target);
                    Err(Error::Timeout)
                }
            }
            Err(e) => Err(error::timeout_on_would_block(e)),
        }
    }

    /// Drain frames until an RTACP one arrives (or `timeout_ms` elapses).
    /// A MSG targeted at a specific node (not broadcast) triggers an
    /// automatically-synthesized ACK, echoing sender/target and the
    /// original payload, before the message is returned to the caller.
    /// Broadcast MSGs and ACK frames are returned with no further action.
    pub fn receive(&mut self, timeout_ms: u32) -> Result<RtacpMessage, Error> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            let window_ms = if timeout_ms == 0 {
                0
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout);
                }
                remaining.as_millis().min(u128::from(u32::MAX)) as u32
            };

            let frame = self
                .ctx
                .backend_mut()
                .receive(window_ms)
                .map_err(error::timeout_on_would_block)?;

            let Some(msg) = unpack(&frame) else {
                continue;
            };

            if !msg.is_ack && !msg.target.is_broadcast() {
                let ack_id = pack_id(true, msg.priority, self.ctx.node_address(), msg.sender);
                let ack_frame = Frame::new(ack_id, msg.payload())?;
                self.ctx
                    .backend_mut()
                    .send(&ack_frame)
                    .map_err(error::backpressure_on_would_block)?;
            }

            return Ok(msg);
        }
    }
}
