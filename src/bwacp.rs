//! BWACP: block-write transfers addressed to a single node or a class of
//! nodes, using READY/DATA/REPEAT frames and a toggling parity bit to catch
//! lost continuation frames.
//!
//! Unlike PSACP, CRC verification on a delivered block is the caller's
//! responsibility (§4.11): [`Bwacp::receive`] hands back the reassembled
//! payload together with the wire CRC regardless of whether it matches, and
//! [`BwacpMessage::crc_ok`] is offered purely as a convenience.

use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::backend::Backend;
use crate::context::Context;
use crate::crc::{crc24, crc24_from_bytes, crc24_to_bytes};
use crate::error::{self, Error};
use crate::frame::{Frame, NodeAddress, Priority, ProtocolClass};
use crate::payload::Payload;
use crate::stuffing::{self, StuffedBuf, UnstuffOutcome};

bitflags! {
    /// Receiver-class selector carried in the 6-bit class-mask field, used
    /// only when `target == NodeAddress::MULTICAST`. Bits beyond the four
    /// named classes are reserved and simply round-trip through `from_bits`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassMask: u8 {
        const SBC = 0b0000_0001;
        const MCU = 0b0000_0010;
        const SENSOR = 0b0000_0100;
        const MOTOR = 0b0000_1000;
        const RESERVED_A = 0b0001_0000;
        const RESERVED_B = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Repeat,
    Ready,
    Data,
}

impl Kind {
    const fn bits(self) -> u32 {
        match self {
            Kind::Repeat => 1,
            Kind::Ready => 3,
            Kind::Data => 7,
        }
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(Kind::Repeat),
            3 => Some(Kind::Ready),
            7 => Some(Kind::Data),
            _ => None,
        }
    }
}

struct Decoded {
    kind: Kind,
    priority: Priority,
    sender: NodeAddress,
    target: NodeAddress,
    class_mask: ClassMask,
    /// Interrupt-ongoing (READY), repeat-all-vs-last (REPEAT), or a per-frame
    /// repeat marker (DATA), per the single overloaded `flag` bit in §3.
    flag: bool,
    /// Toggling parity bit (DATA), fixed `1` (READY) or `0` (REPEAT).
    tail: bool,
    data: [u8; 8],
    data_len: u8,
}

impl Decoded {
    fn data(&self) -> &[u8] {
        &self.data[..self.data_len as usize]
    }
}

fn pack_id(
    kind: Kind,
    priority: Priority,
    sender: NodeAddress,
    target: NodeAddress,
    class_mask: ClassMask,
    flag: bool,
    tail: bool,
) -> u32 {
    (u32::from(ProtocolClass::Bwacp.bits()) << 26)
        | (kind.bits() << 22)
        | (u32::from(priority.bits()) << 20)
        | (u32::from(sender.value()) << 14)
        | (u32::from(target.value()) << 8)
        | (u32::from(class_mask.bits()) << 2)
        | (u32::from(flag) << 1)
        | u32::from(tail)
}

fn unpack(frame: &Frame) -> Option<Decoded> {
    if frame.protocol_class() != Some(ProtocolClass::Bwacp) {
        return None;
    }
    let id = frame.id();
    let kind = Kind::from_bits((id >> 22) & 0x0F)?;
    let priority = Priority::from_bits(((id >> 20) & 0b11) as u8);
    let sender = NodeAddress::new(((id >> 14) & 0x3F) as u8).ok()?;
    let target = NodeAddress::new(((id >> 8) & 0x3F) as u8).ok()?;
    let class_mask = ClassMask::from_bits_truncate(((id >> 2) & 0x3F) as u8);
    let flag = (id >> 1) & 0b1 != 0;
    let tail = id & 0b1 != 0;

    let mut data = [0u8; 8];
    data[..frame.data().len()].copy_from_slice(frame.data());
    Some(Decoded {
        kind,
        priority,
        sender,
        target,
        class_mask,
        flag,
        tail,
        data,
        data_len: frame.dlc(),
    })
}

/// One key for the BWACP reassembly table: the block's sender and target. A
/// sender may have at most one in-flight block per target at a time (this
/// includes the multicast target `0x3F`, tracked as a single stream per
/// distinct sender regardless of class mask).
pub(crate) type StreamKey = (NodeAddress, NodeAddress);

pub(crate) struct ReassemblyState {
    app_address: u32,
    crc_received: u32,
    priority: Priority,
    class_mask: ClassMask,
    expected_tail: bool,
    raw: [u8; stuffing::MAX_STUFFED_LEN],
    raw_len: usize,
}

/// A fully reassembled BWACP block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BwacpMessage {
    pub sender: NodeAddress,
    pub target: NodeAddress,
    pub class_mask: ClassMask,
    pub priority: Priority,
    pub app_address: u32,
    crc_received: u32,
    payload: Payload,
}

impl BwacpMessage {
    /// The reassembled (unstuffed) application payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// The CRC24 carried on the wire's READY frame, exactly as received.
    #[must_use]
    pub fn crc_received(&self) -> u32 {
        self.crc_received
    }

    /// Recompute CRC24 over `(app_address || re-stuffed payload)` and
    /// compare against [`BwacpMessage::crc_received`]. A convenience only —
    /// §4.11 makes CRC verification on a delivered BWACP block the caller's
    /// responsibility, so [`Bwacp::receive`] never fails on a mismatch the
    /// way [`crate::psacp::Psacp::receive`] does.
    #[must_use]
    pub fn crc_ok(&self) -> bool {
        let Ok(stuffed) = StuffedBuf::new(self.payload.as_slice()) else {
            return false;
        };
        let mut buf = [0u8; 4 + stuffing::MAX_STUFFED_LEN];
        buf[..4].copy_from_slice(&self.app_address.to_be_bytes());
        buf[4..4 + stuffed.len()].copy_from_slice(stuffed.as_slice());
        crc24(&buf[..4 + stuffed.len()]) == self.crc_received
    }
}

/// A decoded event surfaced by [`Bwacp::receive`]: either a fully
/// reassembled block, or a `REPEAT` request from a peer that wants a
/// retransmission of a block this context previously sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BwacpEvent {
    /// A block completed reassembly (its last DATA frame's stuffed stream
    /// closed with the terminator).
    Delivered(BwacpMessage),
    /// A peer is requesting retransmission. `repeat_all` distinguishes a
    /// full-sequence repeat from a last-frame-only repeat; resending is the
    /// caller's responsibility — this layer keeps no send-side history.
    Repeat {
        sender: NodeAddress,
        target: NodeAddress,
        priority: Priority,
        repeat_all: bool,
    },
}

/// The BWACP layer, borrowed from a [`Context`] for the duration of a call.
pub struct Bwacp<'a, B: Backend> {
    ctx: &'a mut Context<B>,
}

impl<'a, B: Backend> Bwacp<'a, B> {
    pub(crate) fn new(ctx: &'a mut Context<B>) -> Self {
        Self { ctx }
    }

    /// Send a single continuation DATA frame. Exposed publicly so a caller
    /// that wants to drive the parity toggle itself (e.g. resending after a
    /// REPEAT) can do so; [`Bwacp::send_ready`] uses this internally for the
    /// frames following the initial READY.
    pub fn send_data(
        &mut self,
        target: NodeAddress,
        priority: Priority,
        class_mask: ClassMask,
        tail: bool,
        repeat_marker: bool,
        chunk: &[u8],
    ) -> Result<(), Error> {
        if chunk.len() > 8 {
            return Err(Error::InvalidArgument("BWACP DATA payload exceeds 8 bytes"));
        }
        let sender = self.ctx.node_address();
        let id = pack_id(Kind::Data, priority, sender, target, class_mask, repeat_marker, tail);
        let frame = Frame::new(id, chunk)?;
        self.ctx
            .backend_mut()
            .send(&frame)
            .map_err(error::backpressure_on_would_block)
    }

    /// Stuff `payload`, compute its CRC24 over `(app_address || stuffed
    /// payload)`, emit the READY frame (three CRC bytes, four address
    /// bytes, and at most one initial stuffed byte), then emit as many DATA
    /// continuation frames as the remainder needs, toggling the parity bit
    /// starting from `false`.
    ///
    /// `target == NodeAddress::MULTICAST` signals a class-addressed block;
    /// `class_mask` then selects which receiver classes should accept it.
    /// `interrupt` sets READY's overloaded flag bit, telling a receiver with
    /// an in-progress block from this sender/target pair to discard it and
    /// restart reassembly from this READY.
    pub fn send_ready(
        &mut self,
        target: NodeAddress,
        class_mask: ClassMask,
        priority: Priority,
        app_address: u32,
        payload: &[u8],
        interrupt: bool,
    ) -> Result<(), Error> {
        let stuffed = StuffedBuf::new(payload)?;
        let addr_bytes = app_address.to_be_bytes();

        let mut crc_input = [0u8; 4 + stuffing::MAX_STUFFED_LEN];
        crc_input[..4].copy_from_slice(&addr_bytes);
        crc_input[4..4 + stuffed.len()].copy_from_slice(stuffed.as_slice());
        let crc_bytes = crc24_to_bytes(crc24(&crc_input[..4 + stuffed.len()]));

        // READY always carries exactly one initial stuffed byte: the
        // stuffed form is never empty (an empty payload still stuffs to the
        // single terminator byte), so "at most one" is "exactly one" here.
        let first_len = stuffed.as_slice().len().min(1);
        let mut first = [0u8; 8];
        first[0..3].copy_from_slice(&crc_bytes);
        first[3..7].copy_from_slice(&addr_bytes);
        first[7..7 + first_len].copy_from_slice(&stuffed.as_slice()[..first_len]);

        let sender = self.ctx.node_address();
        let id = pack_id(Kind::Ready, priority, sender, target, class_mask, interrupt, true);
        let frame = Frame::new(id, &first[..7 + first_len])?;
        self.ctx
            .backend_mut()
            .send(&frame)
            .map_err(error::backpressure_on_would_block)?;

        let mut remaining = &stuffed.as_slice()[first_len..];
        let mut tail = false;
        while !remaining.is_empty() {
            let chunk_len = remaining.len().min(8);
            let (chunk, rest) = remaining.split_at(chunk_len);
            self.send_data(target, priority, class_mask, tail, false, chunk)?;
            tail = !tail;
            remaining = rest;
        }
        Ok(())
    }

    /// Send a zero-payload REPEAT, asking `target` to resend either its
    /// whole in-flight block (`repeat_all = true`) or just its last DATA
    /// frame.
    pub fn send_repeat(
        &mut self,
        target: NodeAddress,
        priority: Priority,
        repeat_all: bool,
    ) -> Result<(), Error> {
        let sender = self.ctx.node_address();
        let id = pack_id(Kind::Repeat, priority, sender, target, ClassMask::empty(), repeat_all, false);
        let frame = Frame::new(id, &[])?;
        self.ctx
            .backend_mut()
            .send(&frame)
            .map_err(error::backpressure_on_would_block)
    }

    /// Drain frames until a block completes reassembly or a REPEAT arrives.
    ///
    /// Follows the receiver state machine in §4.11 literally: a READY
    /// (re)starts the (sender, target) stream (clobbering whatever was
    /// in-flight, which is exactly the `interrupt = 1` transition since a
    /// plain restart and an explicit interrupt look identical from the
    /// reassembly table's point of view); DATA frames must alternate their
    /// parity bit starting from `false` or the stream is abandoned with
    /// [`Error::InvalidFrame`], since the bit's entire purpose is catching a
    /// lost frame.
    pub fn receive(&mut self, timeout_ms: u32) -> Result<BwacpEvent, Error> {
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
            let Some(decoded) = unpack(&frame) else {
                continue;
            };

            if decoded.kind == Kind::Repeat {
                return Ok(BwacpEvent::Repeat {
                    sender: decoded.sender,
                    target: decoded.target,
                    priority: decoded.priority,
                    repeat_all: decoded.flag,
                });
            }

            let key: StreamKey = (decoded.sender, decoded.target);

            match decoded.kind {
                Kind::Ready => {
                    let data = decoded.data();
                    if data.len() < 7 {
                        continue;
                    }
                    let crc_received = crc24_from_bytes([data[0], data[1], data[2]]);
                    let app_address = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
                    let mut raw = [0u8; stuffing::MAX_STUFFED_LEN];
                    let chunk = &data[7..];
                    raw[..chunk.len()].copy_from_slice(chunk);
                    self.ctx.bwacp_table_mut().insert(
                        key,
                        ReassemblyState {
                            app_address,
                            crc_received,
                            priority: decoded.priority,
                            class_mask: decoded.class_mask,
                            expected_tail: false,
                            raw,
                            raw_len: chunk.len(),
                        },
                    )?;
                }
                Kind::Data => {
                    let Some(state) = self.ctx.bwacp_table_mut().get_mut(key) else {
                        continue;
                    };
                    if decoded.tail != state.expected_tail {
                        log::debug!(
                            "bwacp stream ({:?}, {:?}) parity mismatch, expected {} got {}",
                            decoded.sender, decoded.target, state.expected_tail, decoded.tail
                        );
                        self.ctx.bwacp_table_mut().remove(key);
                        return Err(Error::InvalidFrame);
                    }
                    state.expected_tail = !state.expected_tail;
                    let chunk = decoded.data();
                    if state.raw_len + chunk.len() > state.raw.len() {
                        self.ctx.bwacp_table_mut().remove(key);
                        return Err(Error::BufferTooSmall);
                    }
                    state.raw[state.raw_len..state.raw_len + chunk.len()].copy_from_slice(chunk);
                    state.raw_len += chunk.len();
                }
                Kind::Repeat => unreachable!("handled above"),
            }

            let Some(state) = self.ctx.bwacp_table_mut().get_mut(key) else {
                continue;
            };
            let mut unstuffed = [0u8; stuffing::MAX_STUFFED_LEN];
            match stuffing::unstuff_streaming(&state.raw[..state.raw_len], &mut unstuffed) {
                UnstuffOutcome::Complete(n) => {
                    let msg = BwacpMessage {
                        sender: decoded.sender,
                        target: decoded.target,
                        class_mask: state.class_mask,
                        priority: state.priority,
                        app_address: state.app_address,
                        crc_received: state.crc_received,
                        payload: Payload::from_slice(&unstuffed[..n])?,
                    };
                    self.ctx.bwacp_table_mut().remove(key);
                    return Ok(BwacpEvent::Delivered(msg));
                }
                UnstuffOutcome::Incomplete => continue,
                UnstuffOutcome::Invalid => {
                    log::debug!("bwacp stream ({:?}, {:?}) had invalid byte stuffing", decoded.sender, decoded.target);
                    self.ctx.bwacp_table_mut().remove(key);
                    return Err(Error::InvalidStuffing);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::queue::LocalQueueBackend;

    fn addr(v: u8) -> NodeAddress {
        NodeAddress::new(v).unwrap()
    }

    #[test]
    fn scenario_s5_ready_then_data() {
        let mut ctx = Context::init_custom(0x01, LocalQueueBackend::new()).unwrap();
        ctx.bwacp()
            .send_ready(addr(0x02), ClassMask::empty(), Priority::High, 0xDEAD_BEEF, &[0xAA], false)
            .unwrap();

        let ready = ctx.backend_mut().receive(0).unwrap();
        assert_eq!(ready.dlc(), 8);

        let data_bytes = ready.data();
        let crc = crc24_from_bytes([data_bytes[0], data_bytes[1], data_bytes[2]]);
        assert_eq!(crc, crc24(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0xAA, 0xFF]));
        assert_eq!(&data_bytes[3..], &[0xDE, 0xAD, 0xBE, 0xEF, 0x01]);

        let data_frame = ctx.backend_mut().receive(0).unwrap();
        assert_eq!(data_frame.dlc(), 2);
        assert_eq!(data_frame.data(), &[0xAA, 0xFF]);
        assert_eq!(data_frame.id() & 0b1, 0); // tail bit 0 on the first DATA frame
    }

    #[test]
    fn ready_then_data_reassembles_in_one_context() {
        let mut ctx = Context::init_custom(0x01, LocalQueueBackend::new()).unwrap();
        ctx.bwacp()
            .send_ready(addr(0x02), ClassMask::empty(), Priority::High, 0xDEAD_BEEF, &[0xAA], false)
            .unwrap();

        let event = ctx.bwacp().receive(0).unwrap();
        let BwacpEvent::Delivered(msg) = event else {
            panic!("expected a delivered block");
        };
        assert_eq!(msg.payload(), &[0xAA]);
        assert_eq!(msg.app_address, 0xDEAD_BEEF);
        assert!(msg.crc_ok());
    }

    #[test]
    fn larger_payload_spans_several_data_frames() {
        let mut ctx = Context::init_custom(0x01, LocalQueueBackend::new()).unwrap();
        let payload = [0x5Au8; 30];
        ctx.bwacp()
            .send_ready(NodeAddress::MULTICAST, ClassMask::SENSOR | ClassMask::MOTOR, Priority::Low, 1, &payload, false)
            .unwrap();

        let event = ctx.bwacp().receive(0).unwrap();
        let BwacpEvent::Delivered(msg) = event else {
            panic!("expected a delivered block");
        };
        assert_eq!(msg.payload(), &payload[..]);
        assert_eq!(msg.class_mask, ClassMask::SENSOR | ClassMask::MOTOR);
        assert!(msg.crc_ok());
    }

    #[test]
    fn tail_parity_violation_is_reported() {
        // A 10-byte payload stuffs to 12 bytes (count + 10 + terminator);
        // READY only ever carries the first one, so reassembly genuinely
        // needs two DATA frames and is still in progress when the second
        // (deliberately mis-paritied) one arrives — unlike a payload short
        // enough to complete within READY + a single DATA frame, which
        // would have left nothing in flight to violate.
        let mut ctx = Context::init_custom(0x01, LocalQueueBackend::new()).unwrap();
        let payload = [0x7Bu8; 10];
        let stuffed = StuffedBuf::new(&payload).unwrap();
        assert_eq!(stuffed.as_slice().len(), 12);

        let ready_id = pack_id(Kind::Ready, Priority::High, addr(0x09), addr(0x02), ClassMask::empty(), false, true);
        let mut ready_data = [0u8; 8];
        ready_data[3..7].copy_from_slice(&0u32.to_be_bytes());
        ready_data[7] = stuffed.as_slice()[0];
        ctx.backend_mut()
            .send(&Frame::new(ready_id, &ready_data).unwrap())
            .unwrap();

        // First (correct) DATA frame: tail=0, matching the expected starting
        // parity. Only 8 of the remaining 11 stuffed bytes fit.
        let good_id = pack_id(Kind::Data, Priority::High, addr(0x09), addr(0x02), ClassMask::empty(), false, false);
        ctx.backend_mut()
            .send(&Frame::new(good_id, &stuffed.as_slice()[1..9]).unwrap())
            .unwrap();

        // Second DATA frame duplicates tail=0 instead of alternating to 1.
        let bad_id = pack_id(Kind::Data, Priority::High, addr(0x09), addr(0x02), ClassMask::empty(), false, false);
        ctx.backend_mut()
            .send(&Frame::new(bad_id, &stuffed.as_slice()[9..]).unwrap())
            .unwrap();

        // All three frames are already queued, and `receive` keeps draining
        // internally until a terminal outcome, so this single call is the
        // one that runs into the parity violation.
        let err = ctx.bwacp().receive(0).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame));
    }

    #[test]
    fn repeat_is_surfaced_without_touching_reassembly_state() {
        let mut ctx = Context::init_custom(0x02, LocalQueueBackend::new()).unwrap();
        ctx.bwacp().send_repeat(addr(0x01), Priority::MedHigh, true).unwrap();

        let event = ctx.bwacp().receive(0).unwrap();
        assert_eq!(
            event,
            BwacpEvent::Repeat {
                sender: addr(0x02),
                target: addr(0x01),
                priority: Priority::MedHigh,
                repeat_all: true,
            }
        );
    }
}
