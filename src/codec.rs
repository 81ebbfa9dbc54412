//! # Register Codec
//!
//! Conversion between f32 values and the two holding registers that carry
//! them on the sensor.
//!
//! ## Layout
//!
//! Bytes are big-endian inside each register and the most significant
//! register comes first (ABCD). For `25.0` (`0x41C80000`):
//!
//! | Register | Value |
//! |----------|-------|
//! | n | `0x41C8` |
//! | n + 1 | `0x0000` |

use crate::constants::FLOAT_REGISTER_COUNT;
use crate::error::DecodeError;
use crate::protocol::UnitId;

/// Register codec for the sensor's f32 registers.
pub struct RegisterCodec;

impl RegisterCodec {
    /// Encode an f32 into two registers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sensor_readdress::RegisterCodec;
    ///
    /// assert_eq!(RegisterCodec::encode_f32(25.0), [0x41C8, 0x0000]);
    /// ```
    #[inline]
    pub fn encode_f32(value: f32) -> [u16; 2] {
        let b = value.to_be_bytes();
        [
            u16::from_be_bytes([b[0], b[1]]),
            u16::from_be_bytes([b[2], b[3]]),
        ]
    }

    /// Decode two registers into an f32.
    ///
    /// Fails when the transport handed back anything but exactly two registers.
    #[inline]
    pub fn decode_f32(regs: &[u16]) -> Result<f32, DecodeError> {
        match regs {
            [hi, lo] => {
                let [a, b] = hi.to_be_bytes();
                let [c, d] = lo.to_be_bytes();
                Ok(f32::from_be_bytes([a, b, c, d]))
            }
            _ => Err(DecodeError {
                expected: FLOAT_REGISTER_COUNT as usize,
                actual: regs.len(),
            }),
        }
    }

    /// Encode a unit id the way the identity register stores it.
    #[inline]
    pub fn encode_unit_id(id: UnitId) -> [u16; 2] {
        Self::encode_f32(id.as_f32())
    }

    /// Decode an identity register.
    ///
    /// Returns `Ok(None)` when the value is well-formed but not a valid id.
    pub fn decode_unit_id(regs: &[u16]) -> Result<Option<UnitId>, DecodeError> {
        Self::decode_f32(regs).map(|v| UnitId::from_f32(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_known_values() {
        assert_eq!(RegisterCodec::encode_f32(0.0), [0x0000, 0x0000]);
        assert_eq!(RegisterCodec::encode_f32(1.0), [0x3F80, 0x0000]);
        assert_eq!(RegisterCodec::encode_f32(7.0), [0x40E0, 0x0000]);
        assert_eq!(RegisterCodec::encode_f32(-2.5), [0xC020, 0x0000]);
    }

    #[test]
    fn test_decode_known_values() {
        assert_eq!(RegisterCodec::decode_f32(&[0x41C8, 0x0000]), Ok(25.0));
        assert_eq!(RegisterCodec::decode_f32(&[0x3F00, 0x0000]), Ok(0.5));
    }

    #[test]
    fn test_word_order_is_big_endian() {
        // 123.456 = 0x42F6E979, high word first
        assert_eq!(RegisterCodec::encode_f32(123.456), [0x42F6, 0xE979]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            RegisterCodec::decode_f32(&[0x3F80]),
            Err(DecodeError {
                expected: 2,
                actual: 1
            })
        );
        assert!(RegisterCodec::decode_f32(&[]).is_err());
        assert!(RegisterCodec::decode_f32(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_unit_id_round_trip() {
        let id = UnitId::new(42).unwrap();
        let regs = RegisterCodec::encode_unit_id(id);
        assert_eq!(RegisterCodec::decode_unit_id(&regs), Ok(Some(id)));
    }

    #[test]
    fn test_decode_unit_id_non_integer() {
        let regs = RegisterCodec::encode_f32(3.25);
        assert_eq!(RegisterCodec::decode_unit_id(&regs), Ok(None));
    }

    proptest! {
        #[test]
        fn prop_finite_round_trip(v in any::<f32>().prop_filter("finite", |v| v.is_finite())) {
            let decoded = RegisterCodec::decode_f32(&RegisterCodec::encode_f32(v)).unwrap();
            prop_assert_eq!(decoded, v);
        }

        #[test]
        fn prop_any_bits_round_trip(bits in any::<u32>()) {
            let v = f32::from_bits(bits);
            let decoded = RegisterCodec::decode_f32(&RegisterCodec::encode_f32(v)).unwrap();
            prop_assert_eq!(decoded.to_bits(), bits);
        }
    }
}
