//! CRC16-CCITT and CRC24, as required by RPCACP/PSACP and BWACP respectively.
//!
//! Both are pure functions over a byte slice with no allocation and no
//! internal state beyond the running accumulator.

/// CRC16-CCITT (polynomial `0x1021`, initial value `0xFFFF`).
///
/// Used to protect RPCACP `StartRPC`/`StartReturn` headers and PSACP `PUB`
/// payloads. The CRC of an empty buffer is `0xFFFF` (property #3 in the
/// spec: the initial value passes through unchanged).
#[must_use]
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    const POLY: u16 = 0x1021;
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// CRC24 (polynomial `0x864CFB`, initial value `0xB704CE`).
///
/// Used exclusively by BWACP `READY` frames to protect the application
/// address together with the stuffed payload. Returned as a `u32` with the
/// top byte always zero; callers split it into three big-endian bytes for
/// the wire.
#[must_use]
pub fn crc24(data: &[u8]) -> u32 {
    const POLY: u32 = 0x00864CFB;
    const MASK: u32 = 0x00FF_FFFF;
    let mut crc: u32 = 0x00B7_04CE;
    for &byte in data {
        crc ^= (byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= POLY;
            }
        }
        crc &= MASK;
    }
    crc
}

/// Split a 24-bit CRC into its three big-endian wire bytes, most significant
/// first (matches scenario S5's `crc_b2 crc_b1 crc_b0` ordering).
#[must_use]
pub fn crc24_to_bytes(crc: u32) -> [u8; 3] {
    [(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]
}

/// Reassemble a 24-bit CRC from its three big-endian wire bytes.
#[must_use]
pub fn crc24_from_bytes(bytes: [u8; 3]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_of_empty_is_initial_value() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn crc16_is_deterministic() {
        let data = b"Hello";
        assert_eq!(crc16_ccitt(data), crc16_ccitt(data));
    }

    #[test]
    fn crc16_distinguishes_inputs() {
        assert_ne!(crc16_ccitt(b"abc"), crc16_ccitt(b"abd"));
    }

    #[test]
    fn crc24_of_empty_is_initial_value() {
        assert_eq!(crc24(&[]), 0x00B7_04CE);
    }

    #[test]
    fn crc24_roundtrips_through_bytes() {
        let crc = crc24(b"artie");
        let bytes = crc24_to_bytes(crc);
        assert_eq!(crc24_from_bytes(bytes), crc);
    }

    #[test]
    fn crc24_stays_within_24_bits() {
        let crc = crc24(b"a longer buffer to exercise more shift iterations of the crc24 loop");
        assert_eq!(crc & !0x00FF_FFFF, 0);
    }

    proptest::proptest! {
        /// Property #3: identical inputs always produce identical CRCs, and
        /// the 24-bit variant never sets a bit above its width.
        #[test]
        fn prop_crc16_is_a_pure_function(data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..512)) {
            proptest::prop_assert_eq!(crc16_ccitt(&data), crc16_ccitt(&data));
        }

        #[test]
        fn prop_crc24_stays_in_range(data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..512)) {
            let crc = crc24(&data);
            proptest::prop_assert_eq!(crc & !0x00FF_FFFF, 0);
            proptest::prop_assert_eq!(crc24_from_bytes(crc24_to_bytes(crc)), crc);
        }
    }
}
