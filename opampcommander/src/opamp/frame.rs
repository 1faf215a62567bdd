//! OpAMP binary frame codec.
//!
//! Frames travel as binary WebSocket payloads in one of two forms, both of
//! which must keep decoding bit-exactly for the agent population already in
//! the field:
//!
//! - header-prefixed: a uvarint header whose value is `0` (reserved),
//!   followed by the protobuf message. The first byte is always `0x00`.
//! - legacy: the payload is the protobuf message with no header. A protobuf
//!   message never starts with `0x00` (that would be field number 0), which
//!   is how the two forms are told apart.

use prost::Message;
use thiserror::Error;

const HEADER_FIRST_BYTE: u8 = 0x00;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("bad frame: {0}")]
    BadFrame(&'static str),

    #[error("non-zero frame header: {0}")]
    NonZeroHeader(u64),

    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Decodes a binary payload in either wire form.
pub fn decode<M: Message + Default>(payload: &[u8]) -> Result<M, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::BadFrame("empty payload"));
    }
    let body = if payload[0] == HEADER_FIRST_BYTE {
        let (header, header_len) =
            read_uvarint(payload).ok_or(FrameError::BadFrame("truncated header"))?;
        if header != 0 {
            return Err(FrameError::NonZeroHeader(header));
        }
        &payload[header_len..]
    } else {
        payload
    };
    Ok(M::decode(body)?)
}

/// Encodes a frame in the header-prefixed form.
pub fn encode<M: Message>(frame: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + frame.encoded_len());
    buf.push(HEADER_FIRST_BYTE);
    buf.extend(frame.encode_to_vec());
    buf
}

fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}
