//! The frame model: the atomic unit that crosses every [`crate::backend::Backend`]
//! boundary, plus the handful of field types (`NodeAddress`, `Priority`,
//! `ProtocolClass`) shared by all four protocol layers.

use crate::error::Error;

/// A CAN node address. Six bits, `0x00..=0x3F`.
///
/// `0x00` is reserved for broadcast, `0x3F` for the BWACP class-multicast
/// target. Both reserved values still construct successfully — it is each
/// protocol layer's job to reject them where they are not meaningful (e.g.
/// RPCACP forbids broadcast targets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddress(u8);

impl NodeAddress {
    /// Reserved broadcast address.
    pub const BROADCAST: NodeAddress = NodeAddress(0x00);
    /// Reserved BWACP class-multicast target.
    pub const MULTICAST: NodeAddress = NodeAddress(0x3F);

    /// Construct a node address, rejecting anything outside `0x00..=0x3F`.
    pub fn new(value: u8) -> Result<Self, Error> {
        if value > 0x3F {
            return Err(Error::InvalidArgument("node address exceeds 0x3F"));
        }
        Ok(Self(value))
    }

    /// The raw 6-bit value.
    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }

    /// Whether this is the reserved broadcast address.
    #[must_use]
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

/// CAN arbitration priority, encoded as the two priority bits present in
/// every protocol's identifier layout. Lower numeric value arbitrates first;
/// this stack does not enforce priority beyond placing it correctly in the
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Priority {
    High = 0b00,
    MedHigh = 0b01,
    MedLow = 0b10,
    Low = 0b11,
}

impl Priority {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Priority::High,
            0b01 => Priority::MedHigh,
            0b10 => Priority::MedLow,
            _ => Priority::Low,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        self as u8
    }
}

/// The top 3 identifier bits, identifying which of the four overlaid
/// protocols a frame belongs to. PSACP is split across two priority tiers
/// that still decode to the same logical protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolClass {
    Rtacp,
    Rpcacp,
    PsacpHigh,
    Bwacp,
    PsacpLow,
}

impl ProtocolClass {
    pub(crate) const fn bits(self) -> u8 {
        match self {
            ProtocolClass::Rtacp => 0b000,
            ProtocolClass::Rpcacp => 0b010,
            ProtocolClass::PsacpHigh => 0b100,
            ProtocolClass::Bwacp => 0b101,
            ProtocolClass::PsacpLow => 0b110,
        }
    }

    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b111 {
            0b000 => Some(ProtocolClass::Rtacp),
            0b010 => Some(ProtocolClass::Rpcacp),
            0b100 => Some(ProtocolClass::PsacpHigh),
            0b101 => Some(ProtocolClass::Bwacp),
            0b110 => Some(ProtocolClass::PsacpLow),
            _ => None,
        }
    }

    /// Whether this class is one of the two PSACP priority tiers.
    #[must_use]
    pub fn is_psacp(self) -> bool {
        matches!(self, ProtocolClass::PsacpHigh | ProtocolClass::PsacpLow)
    }
}

/// Maximum payload length of a single CAN data frame.
pub const MAX_DATA_LEN: usize = 8;

/// A single CAN frame: the atomic unit handed to and received from a
/// [`crate::backend::Backend`].
///
/// Always carries a 29-bit extended identifier in this stack; `extended` is
/// still an explicit field (rather than implied) because backends report it
/// off the wire and must reject base-id frames rather than silently
/// reinterpreting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    extended: bool,
    id: u32,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl Frame {
    /// Build a new extended frame from an identifier and a data slice.
    ///
    /// Fails with [`Error::InvalidArgument`] if `id` does not fit in 29 bits
    /// or `data` is longer than [`MAX_DATA_LEN`].
    pub fn new(id: u32, data: &[u8]) -> Result<Self, Error> {
        if id > 0x1FFF_FFFF {
            return Err(Error::InvalidArgument("identifier exceeds 29 bits"));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(Error::InvalidArgument("data length exceeds 8 bytes"));
        }
        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            extended: true,
            id,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Whether the frame carries a 29-bit extended identifier. Backends
    /// report `false` for base (11-bit) frames observed on the bus; the
    /// protocol dispatcher drops those at ingress.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Mark a frame as having arrived with a base (11-bit) identifier. Only
    /// backends construct frames this way; application code always builds
    /// extended frames via [`Frame::new`].
    #[must_use]
    pub(crate) fn mark_base(mut self) -> Self {
        self.extended = false;
        self
    }

    /// The 29-bit identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The data bytes, `0..=8` long.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Data length, `0..=8`.
    #[must_use]
    pub fn dlc(&self) -> u8 {
        self.len
    }

    /// Decode the top 3 identifier bits into a [`ProtocolClass`], or `None`
    /// if they do not match any of the five valid patterns (the frame must
    /// be dropped at ingress in that case).
    #[must_use]
    pub fn protocol_class(&self) -> Option<ProtocolClass> {
        ProtocolClass::from_bits((self.id >> 26) as u8)
    }
}

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<embedded_can::Id>, data: &[u8]) -> Option<Self> {
        let raw = match id.into() {
            embedded_can::Id::Standard(sid) => u32::from(sid.as_raw()),
            embedded_can::Id::Extended(eid) => eid.as_raw(),
        };
        Frame::new(raw, data).ok()
    }

    fn new_remote(_id: impl Into<embedded_can::Id>, _dlc: usize) -> Option<Self> {
        // RTR frames are not part of the Artie wire protocol.
        None
    }

    fn is_extended(&self) -> bool {
        self.extended
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> embedded_can::Id {
        if self.extended {
            // `self.id` is always validated to fit in 29 bits at
            // construction time in `Frame::new`.
            embedded_can::Id::Extended(
                embedded_can::ExtendedId::new(self.id).expect("id validated to fit in 29 bits"),
            )
        } else {
            embedded_can::Id::Standard(
                embedded_can::StandardId::new(self.id as u16)
                    .expect("base-id frames are always 11 bits"),
            )
        }
    }

    fn dlc(&self) -> usize {
        self.len as usize
    }

    fn data(&self) -> &[u8] {
        self.data()
    }
}

/// Dispatch utility used by [`crate::context::Context`]: decode the protocol
/// class of a frame without committing to any particular layer's full parse.
#[must_use]
pub fn get_protocol(frame: &Frame) -> Option<ProtocolClass> {
    frame.protocol_class()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_address_rejects_out_of_range() {
        assert!(NodeAddress::new(0x40).is_err());
        assert!(NodeAddress::new(0x3F).is_ok());
    }

    #[test]
    fn frame_rejects_oversized_id() {
        assert!(Frame::new(0x2000_0000, &[]).is_err());
    }

    #[test]
    fn frame_rejects_oversized_data() {
        assert!(Frame::new(0, &[0; 9]).is_err());
    }

    #[test]
    fn protocol_class_roundtrips_through_top_bits() {
        for class in [
            ProtocolClass::Rtacp,
            ProtocolClass::Rpcacp,
            ProtocolClass::PsacpHigh,
            ProtocolClass::Bwacp,
            ProtocolClass::PsacpLow,
        ] {
            let id = (class.bits() as u32) << 26;
            let frame = Frame::new(id, &[]).unwrap();
            assert_eq!(frame.protocol_class(), Some(class));
        }
    }

    #[test]
    fn invalid_protocol_bits_are_dropped() {
        let id = 0b011u32 << 26; // not one of the five valid patterns
        let frame = Frame::new(id, &[]).unwrap();
        assert_eq!(frame.protocol_class(), None);
    }

    #[test]
    fn priority_bits_roundtrip() {
        for p in [
            Priority::High,
            Priority::MedHigh,
            Priority::MedLow,
            Priority::Low,
        ] {
            assert_eq!(Priority::from_bits(p.bits()), p);
        }
    }
}
