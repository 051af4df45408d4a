//! Byte-stuffed frame codec.
//!
//! ```text
//! 0x08 | stuffed( sender | receiver | timestamp (8, LE) | seq | len (2, BE) | payload | FCS ) | 0x7E
//! ```
//!
//! Inside the delimiters every `0x08`, `0x1B` and `0x7E` travels as
//! `0x1B, byte ^ 0x20`.

use std::fmt::Write as _;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hamming::{self, DecodeResult};
use crate::types::{
    needs_escape, SeqNumber, StationId, TimestampMs, END_FLAG, ESCAPE, ESCAPE_MASK, HEADER_LEN,
    START_FLAG,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: need at least {required} bytes, got {actual}")]
    TooShort { required: usize, actual: usize },

    #[error("frame is not enclosed in start/end flags")]
    MissingDelimiters,

    #[error("escape byte at end of frame body")]
    TruncatedEscape,

    #[error("frame body truncated: header announces {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("payload of {len} bytes does not fit the {max}-byte length field")]
    PayloadTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub sender: StationId,
    pub receiver: StationId,
    pub timestamp: TimestampMs,
    pub seq: SeqNumber,
    pub payload: Vec<u8>,
    pub fcs: Vec<u8>,
}

impl Frame {
    /// Builds an outbound frame; the FCS is computed over `payload`.
    pub fn new(
        sender: StationId,
        receiver: StationId,
        timestamp: TimestampMs,
        seq: SeqNumber,
        payload: Vec<u8>,
    ) -> Self {
        let fcs = hamming::generate_fcs(&payload);
        Self {
            sender,
            receiver,
            timestamp,
            seq,
            payload,
            fcs,
        }
    }

    pub fn payload_len(&self) -> Result<u16, FrameError> {
        u16::try_from(self.payload.len()).map_err(|_| FrameError::PayloadTooLarge {
            len: self.payload.len(),
            max: u16::MAX as usize,
        })
    }

    /// Serializes the frame into its stuffed wire form, carrying `fcs` as is.
    pub fn create_frame(&self) -> Result<Vec<u8>, FrameError> {
        let len = self.payload_len()?;
        let mut inner = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + self.fcs.len());
        inner.put_u8(self.sender);
        inner.put_u8(self.receiver);
        inner.put_u64_le(self.timestamp);
        inner.put_u8(self.seq);
        inner.put_u16(len);
        inner.put_slice(&self.payload);
        inner.put_slice(&self.fcs);

        let mut wire = Vec::with_capacity(inner.len() * 2 + 2);
        wire.push(START_FLAG);
        stuff_into(&inner, &mut wire);
        wire.push(END_FLAG);
        Ok(wire)
    }

    /// Parses a complete wire frame, delimiters included.
    pub fn parse(wire: &[u8]) -> Result<Self, FrameError> {
        if wire.len() < 2 {
            return Err(FrameError::TooShort {
                required: 2,
                actual: wire.len(),
            });
        }
        if wire[0] != START_FLAG || wire[wire.len() - 1] != END_FLAG {
            return Err(FrameError::MissingDelimiters);
        }
        let inner = unstuff(&wire[1..wire.len() - 1])?;
        Self::parse_unstuffed(&inner)
    }

    fn parse_unstuffed(mut buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooShort {
                required: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let sender = buf.get_u8();
        let receiver = buf.get_u8();
        let timestamp = buf.get_u64_le();
        let seq = buf.get_u8();
        let len = buf.get_u16() as usize;

        let fcs_len = hamming::fcs_len(len);
        if buf.remaining() < len + fcs_len {
            return Err(FrameError::Truncated {
                expected: HEADER_LEN + len + fcs_len,
                actual: HEADER_LEN + buf.remaining(),
            });
        }
        let payload = buf[..len].to_vec();
        buf.advance(len);
        let fcs = buf[..fcs_len].to_vec();

        Ok(Self {
            sender,
            receiver,
            timestamp,
            seq,
            payload,
            fcs,
        })
    }

    /// Runs SECDED over the frame's payload and received FCS.
    pub fn decode(&self) -> DecodeResult {
        hamming::decode_and_correct(&self.payload, &self.fcs)
    }
}

fn stuff_into(inner: &[u8], out: &mut Vec<u8>) {
    for &b in inner {
        if needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_MASK);
        } else {
            out.push(b);
        }
    }
}

/// Byte-stuffs `inner` without adding delimiters.
pub fn stuff(inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(inner.len() * 2);
    stuff_into(inner, &mut out);
    out
}

/// Reverses [`stuff`]. A trailing unresolved escape is an error.
pub fn unstuff(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&b) = bytes.next() {
        if b == ESCAPE {
            let &escaped = bytes.next().ok_or(FrameError::TruncatedEscape)?;
            out.push(escaped ^ ESCAPE_MASK);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

fn hex_byte(b: u8) -> String {
    format!("0x{}", hex::encode_upper([b]))
}

fn hex_list(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| hex_byte(b)).collect::<Vec<_>>().join(" ")
}

/// Splits the stuffed body of a frame into the wire bytes of each logical
/// byte (one byte, or an escape pair).
fn wire_units(body: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < body.len() {
        let width = if body[i] == ESCAPE && i + 1 < body.len() { 2 } else { 1 };
        units.push(&body[i..i + width]);
        i += width;
    }
    units
}

/// Field-by-field dump of a raw frame as it was put on the line.
pub fn describe_wire(wire: &[u8]) -> String {
    let frame = match Frame::parse(wire) {
        Ok(frame) => frame,
        Err(e) => return format!("malformed frame ({}): {}", e, hex_list(wire)),
    };

    let units = wire_units(&wire[1..wire.len() - 1]);
    let payload_start = HEADER_LEN;
    let payload_end = payload_start + frame.payload.len();
    let field = |range: std::ops::Range<usize>| -> String {
        hex_list(&units[range].concat())
    };

    // header fields are shown unescaped, payload and FCS as they travel
    let mut out = String::new();
    let _ = writeln!(out, "Start flag: {}", hex_byte(wire[0]));
    let _ = writeln!(out, "Sender: {}", hex_byte(frame.sender));
    let _ = writeln!(out, "Receiver: {}", hex_byte(frame.receiver));
    let _ = writeln!(
        out,
        "Timestamp: {} ({} ms)",
        hex_list(&frame.timestamp.to_le_bytes()),
        frame.timestamp
    );
    let _ = writeln!(out, "Sequence number: {}", hex_byte(frame.seq));
    let _ = writeln!(
        out,
        "Length: {} ({} bytes)",
        hex_list(&(frame.payload.len() as u16).to_be_bytes()),
        frame.payload.len()
    );
    let _ = writeln!(out, "Payload: {}", field(payload_start..payload_end));
    let _ = writeln!(out, "FCS: {}", field(payload_end..units.len()));
    let _ = write!(out, "End flag: {}", hex_byte(wire[wire.len() - 1]));
    out
}
