//! Single-byte control codes.
//!
//! Control codes travel as the acknowledgment byte of every message and as the
//! handshake byte. Their values sit above the highest possible first byte of a
//! valid length header (`0xF0`), except for `GenericError` which only ever
//! appears where an acknowledgment is expected.

use std::fmt;

use crate::error::{ProtocolError, ProtocolResult};

/// Reserved protocol sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    /// Success / acknowledgment.
    Ok,
    /// Oversized or malformed message.
    GenericError,
    /// Connection rejected: admission limit reached.
    ConnLimit,
    /// Reserved for id collisions.
    Conflict,
}

impl ControlCode {
    /// Every control code, in byte-table order.
    pub const ALL: [ControlCode; 4] = [
        ControlCode::Ok,
        ControlCode::GenericError,
        ControlCode::ConnLimit,
        ControlCode::Conflict,
    ];

    /// Wire byte for this code.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Ok => 0xFF,
            Self::GenericError => 0x00,
            Self::ConnLimit => 0xFE,
            Self::Conflict => 0xFD,
        }
    }

    /// Decode a wire byte.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownControlByte`] for bytes outside the table.
    pub const fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0xFF => Ok(Self::Ok),
            0x00 => Ok(Self::GenericError),
            0xFE => Ok(Self::ConnLimit),
            0xFD => Ok(Self::Conflict),
            other => Err(ProtocolError::UnknownControlByte(other)),
        }
    }

    /// Whether this code signals success.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl TryFrom<u8> for ControlCode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> ProtocolResult<Self> {
        Self::from_byte(byte)
    }
}

impl From<ControlCode> for u8 {
    fn from(code: ControlCode) -> Self {
        code.as_byte()
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::GenericError => "generic error",
            Self::ConnLimit => "connection limit reached",
            Self::Conflict => "conflict",
        };
        write!(f, "{name} (0x{:02x})", self.as_byte())
    }
}
