//! Length prefix codec.
//!
//! Every message is preceded by a 4-byte big-endian length. The width is fixed
//! so a header read never needs look-ahead: exactly [`HEADER_SIZE`] bytes,
//! regardless of payload size.

use crate::error::{ProtocolError, ProtocolResult};

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload a single message may carry.
///
/// Keeps the top byte of any valid header at or below `0xF0`, clear of the
/// `0xFD..=0xFF` control codes.
pub const MSG_MAX_SIZE: u32 = 0xF0FF_FFFF;

/// Encode a payload length as a big-endian prefix.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `n` exceeds [`MSG_MAX_SIZE`].
pub fn encode_size(n: u32) -> ProtocolResult<[u8; HEADER_SIZE]> {
    if n > MSG_MAX_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: u64::from(n),
            max: MSG_MAX_SIZE,
        });
    }
    Ok(n.to_be_bytes())
}

/// Decode a big-endian length prefix.
#[must_use]
pub fn decode_size(bytes: [u8; HEADER_SIZE]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// A decoded length prefix.
///
/// Headers read off the wire may exceed the ceiling; the receiver inspects
/// [`FrameHeader::is_within_limit`] before consuming any payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    length: u32,
}

impl FrameHeader {
    /// Build a header for an outbound payload of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] if `len` exceeds [`MSG_MAX_SIZE`].
    pub fn new(len: usize) -> ProtocolResult<Self> {
        let length = u32::try_from(len)
            .ok()
            .filter(|n| *n <= MSG_MAX_SIZE)
            .ok_or(ProtocolError::FrameTooLarge {
                size: len as u64,
                max: MSG_MAX_SIZE,
            })?;
        Ok(Self { length })
    }

    /// Decode a header read from the wire, without validating the ceiling.
    #[must_use]
    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Self {
            length: decode_size(bytes),
        }
    }

    /// Payload length announced by this header.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Whether the announced length respects [`MSG_MAX_SIZE`].
    #[must_use]
    pub fn is_within_limit(&self) -> bool {
        self.length <= MSG_MAX_SIZE
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] for headers decoded from the
    /// wire that exceed the ceiling.
    pub fn to_bytes(&self) -> ProtocolResult<[u8; HEADER_SIZE]> {
        encode_size(self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_big_endian() {
        assert_eq!(encode_size(0).unwrap(), [0, 0, 0, 0]);
        assert_eq!(encode_size(1).unwrap(), [0, 0, 0, 1]);
        assert_eq!(encode_size(0x0102_0304).unwrap(), [1, 2, 3, 4]);
        assert_eq!(encode_size(MSG_MAX_SIZE).unwrap(), [0xF0, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_size_codec_inverse_at_boundaries() {
        for n in [0, 1, 255, 256, 65_535, 65_536, 0x00FF_FFFF, MSG_MAX_SIZE - 1, MSG_MAX_SIZE] {
            assert_eq!(decode_size(encode_size(n).unwrap()), n);
        }
    }

    #[test]
    fn test_encode_rejects_above_ceiling() {
        let result = encode_size(MSG_MAX_SIZE + 1);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
        assert!(encode_size(u32::MAX).is_err());
    }

    #[test]
    fn test_decode_is_total() {
        assert_eq!(decode_size([0xFF, 0xFF, 0xFF, 0xFF]), u32::MAX);
        let header = FrameHeader::from_bytes([0xF1, 0, 0, 0]);
        assert!(!header.is_within_limit());
        assert!(header.to_bytes().is_err());
    }

    #[test]
    fn test_frame_header_new() {
        let header = FrameHeader::new(42).unwrap();
        assert_eq!(header.length(), 42);
        assert!(header.is_within_limit());
        assert_eq!(header.to_bytes().unwrap(), [0, 0, 0, 42]);

        assert!(FrameHeader::new(MSG_MAX_SIZE as usize).is_ok());
        assert!(FrameHeader::new(MSG_MAX_SIZE as usize + 1).is_err());
    }
}
