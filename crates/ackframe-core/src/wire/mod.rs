//! Wire format for the ackframe protocol.
//!
//! ```text
//! Message   := LENGTH(4 bytes, big-endian u32, <= 0xF0FFFFFF) ACK(1 byte) PAYLOAD(LENGTH bytes)
//! Handshake := 0xFF in each direction
//! ```
//!
//! This module provides:
//! - Fixed-width length prefix encoding ([`codec`])
//! - The closed set of single-byte control codes ([`control`])

pub mod codec;
pub mod control;

pub use codec::{decode_size, encode_size, FrameHeader, HEADER_SIZE, MSG_MAX_SIZE};
pub use control::ControlCode;
