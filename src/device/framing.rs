//! Framing for both protocol layers.
//!
//! Inbound, the device sends `[0x82][length][body...]` frames which may be
//! split or coalesced arbitrarily by serial reads; [`FrameReassembler`]
//! recovers the bodies. Outbound, the host wraps each body in a 6- or
//! 14-byte header (see [`encode_outer_frame`]).
//!
//! Each body is an application frame: `[length][command][transaction id][payload]`.

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use super::protocol::{
    Command, APP_HEADER_LEN, EXTENDED_HEADER_LEN, MAGIC_BYTE, SHORT_HEADER_LEN,
};
use crate::error::{DeviceError, Result};

/// Stateful parser that extracts complete frame bodies from a byte stream.
///
/// Not thread-safe; owned by the read loop.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: BytesMut,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Append newly read bytes and return every frame body that is now complete.
    ///
    /// Bytes preceding a magic byte are discarded to resynchronise after
    /// corruption. Partial frames stay buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    fn try_extract_one(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }

        if self.buffer[0] != MAGIC_BYTE {
            match self.buffer.iter().position(|&b| b == MAGIC_BYTE) {
                Some(index) => {
                    debug!("Discarding {} bytes before next frame start", index);
                    self.buffer.advance(index);
                }
                None => {
                    debug!("No frame start in {} buffered bytes, discarding", self.buffer.len());
                    self.buffer.clear();
                    return None;
                }
            }
        }

        if self.buffer.len() < 2 {
            return None;
        }

        let total = 2 + self.buffer[1] as usize;
        if self.buffer.len() < total {
            return None;
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(2);
        Some(frame.freeze())
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Wrap an outbound body in the transport header.
///
/// Bodies up to 255 bytes get a 6-byte header whose second byte is
/// `0x80 + length` (wrapping); larger bodies get a 14-byte header with
/// `0xFF` and a big-endian u32 length at offset 6. Remaining header bytes
/// are zero.
pub fn encode_outer_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame;
    if payload.len() > 0xff {
        frame = vec![0u8; EXTENDED_HEADER_LEN];
        frame[0] = MAGIC_BYTE;
        frame[1] = 0xff;
        frame[6..10].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    } else {
        frame = vec![0u8; SHORT_HEADER_LEN];
        frame[0] = MAGIC_BYTE;
        frame[1] = 0x80u8.wrapping_add(payload.len() as u8);
    }
    frame.reserve(payload.len());
    frame.extend_from_slice(payload);
    frame
}

/// Recover the body from a complete frame produced by [`encode_outer_frame`].
///
/// A short header of a 127-byte body shares its `0xFF` marker with the
/// extended header, so the short reading is tried first: extended frames
/// are always longer than any short frame.
pub fn decode_outer_frame(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < SHORT_HEADER_LEN {
        return Err(DeviceError::ProtocolMismatch(format!(
            "outer frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    if frame[0] != MAGIC_BYTE {
        return Err(DeviceError::ProtocolMismatch(format!(
            "outer frame starts with 0x{:02x}",
            frame[0]
        )));
    }

    let short_len = frame[1].wrapping_sub(0x80) as usize;
    if frame.len() == SHORT_HEADER_LEN + short_len {
        return Ok(&frame[SHORT_HEADER_LEN..]);
    }

    if frame[1] == 0xff && frame.len() >= EXTENDED_HEADER_LEN {
        let len = u32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
        if frame.len() == EXTENDED_HEADER_LEN + len {
            return Ok(&frame[EXTENDED_HEADER_LEN..]);
        }
    }

    Err(DeviceError::ProtocolMismatch(format!(
        "outer frame length {} does not match its header",
        frame.len()
    )))
}

/// An application frame: command, transaction id and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppFrame {
    pub command: u8,
    pub transaction_id: u8,
    pub payload: Vec<u8>,
}

impl AppFrame {
    pub fn new(command: Command, transaction_id: u8, payload: Vec<u8>) -> Self {
        Self {
            command: command.as_byte(),
            transaction_id,
            payload,
        }
    }

    /// Serialize as `[length][command][transaction id][payload]`.
    ///
    /// The length byte saturates at 255; framebuffer writes exceed it and
    /// the device relies on the transport header instead.
    pub fn encode(&self) -> Vec<u8> {
        let length = (APP_HEADER_LEN + self.payload.len()).min(0xff) as u8;
        let mut bytes = Vec::with_capacity(APP_HEADER_LEN + self.payload.len());
        bytes.push(length);
        bytes.push(self.command);
        bytes.push(self.transaction_id);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse an inbound body, rejecting anything shorter than the header
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < APP_HEADER_LEN {
            return Err(DeviceError::ProtocolMismatch(format!(
                "application frame of {} bytes is shorter than its header",
                body.len()
            )));
        }

        // A saturated length byte means "everything that follows"
        let end = match body[0] {
            0xff => body.len(),
            declared => (declared as usize).clamp(APP_HEADER_LEN, body.len()),
        };

        Ok(Self {
            command: body[1],
            transaction_id: body[2],
            payload: body[APP_HEADER_LEN..end].to_vec(),
        })
    }
}
