//! Zlib compression plugin.
//!
//! Outbound payloads get a one-byte marker prefix:
//!
//! - `0x00`: uncompressed data follows
//! - `0x01`: zlib-compressed data follows
//!
//! Payloads below the threshold, or that do not shrink, travel uncompressed.
//! Inflated output is capped at [`MSG_MAX_SIZE`] unless a lower cap is set.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::{Plugin, PluginResult};
use crate::error::PluginError;
use crate::wire::MSG_MAX_SIZE;

const MARKER_RAW: u8 = 0x00;
const MARKER_ZLIB: u8 = 0x01;

/// Default minimum payload size worth compressing.
pub const DEFAULT_THRESHOLD: usize = 256;

/// Compresses payloads with zlib.
#[derive(Debug, Clone)]
pub struct DeflatePlugin {
    threshold: usize,
    level: Compression,
    max_inflated: u64,
}

impl DeflatePlugin {
    /// Create a plugin compressing payloads of at least `threshold` bytes.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            level: Compression::fast(),
            max_inflated: u64::from(MSG_MAX_SIZE),
        }
    }

    /// Override the compression level (0-9).
    #[must_use]
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    /// Cap the size of a decompressed payload.
    #[must_use]
    pub fn with_max_inflated(mut self, max: u64) -> Self {
        self.max_inflated = max;
        self
    }

    fn raw(msg: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + msg.len());
        out.put_u8(MARKER_RAW);
        out.extend_from_slice(msg);
        out.freeze()
    }

    fn error(message: impl Into<String>) -> PluginError {
        PluginError::new("deflate", message)
    }
}

impl Default for DeflatePlugin {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl Plugin for DeflatePlugin {
    fn name(&self) -> &str {
        "deflate"
    }

    fn transmit(&self, msg: Bytes) -> PluginResult {
        if msg.len() < self.threshold {
            return Ok(Self::raw(&msg));
        }

        let mut compressed = Vec::with_capacity(msg.len() / 2 + 1);
        compressed.push(MARKER_ZLIB);
        let mut encoder = ZlibEncoder::new(compressed, self.level);
        encoder
            .write_all(&msg)
            .map_err(|e| Self::error(format!("zlib write failed: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| Self::error(format!("zlib finish failed: {e}")))?;

        if compressed.len() < msg.len() + 1 {
            Ok(compressed.into())
        } else {
            Ok(Self::raw(&msg))
        }
    }

    fn receive(&self, msg: Bytes) -> PluginResult {
        match msg.first() {
            Some(&MARKER_RAW) => Ok(msg.slice(1..)),
            Some(&MARKER_ZLIB) => {
                let mut decoder = ZlibDecoder::new(&msg[1..]).take(self.max_inflated + 1);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Self::error(format!("zlib decompress failed: {e}")))?;
                if out.len() as u64 > self.max_inflated {
                    return Err(Self::error(format!(
                        "decompressed payload exceeds {} bytes",
                        self.max_inflated
                    )));
                }
                Ok(out.into())
            }
            Some(other) => Err(Self::error(format!("unknown marker byte 0x{other:02x}"))),
            None => Err(Self::error("empty payload has no marker")),
        }
    }
}
