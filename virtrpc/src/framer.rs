//! Wire framing: a 4-byte big-endian length prefix (including itself),
//! followed by the fixed-layout RPC header, followed by an opaque payload.
//!
//! Grounded on `rpc_protocol::lib`'s record-mark helpers
//! (`update_record_mark`/`decode_record_mark`), generalized from a
//! continuation-bit XDR record mark to the plain 4-byte length this
//! protocol uses, and from an XDR call/reply envelope to the fixed
//! `{program, version, procedure, type, serial, status}` header.

use crate::error::{Error, Result};

/// Size in bytes of the length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Size in bytes of the fixed header (six `u32` fields).
pub const HEADER_SIZE: usize = 24;

/// Largest frame (length prefix + header + payload) this implementation
/// will read or write. Frames larger than this are a protocol error rather
/// than an allocation attempt, guarding against a malicious or buggy peer
/// declaring an enormous length (see scenario 5: "oversized frame attack").
pub const MAX_FRAME_LENGTH: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call,
    Reply,
    Message,
    Stream,
}

impl MessageType {
    fn to_wire(self) -> u32 {
        match self {
            MessageType::Call => 0,
            MessageType::Reply => 1,
            MessageType::Message => 2,
            MessageType::Stream => 3,
        }
    }

    fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Reply),
            2 => Ok(MessageType::Message),
            3 => Ok(MessageType::Stream),
            other => Err(Error::protocol(format!("unknown message type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Continue,
}

impl Status {
    fn to_wire(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::Error => 1,
            Status::Continue => 2,
        }
    }

    fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Continue),
            other => Err(Error::protocol(format!("unknown status {other}"))),
        }
    }
}

/// The fixed-layout header carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub message_type: MessageType,
    pub serial: u32,
    pub status: Status,
}

/// Encode a CALL frame: length placeholder, header, payload, then the real
/// length written back over the placeholder.
pub fn encode_request(program: u32, version: u32, procedure: u32, serial: u32, payload: &[u8]) -> Result<Vec<u8>> {
    encode_frame(
        Header {
            program,
            version,
            procedure,
            message_type: MessageType::Call,
            serial,
            status: Status::Ok,
        },
        payload,
    )
}

/// Encode a STREAM frame with the given status (`Continue`, `Ok`, or
/// `Error`).
pub fn encode_stream(program: u32, version: u32, procedure: u32, serial: u32, status: Status, payload: &[u8]) -> Result<Vec<u8>> {
    encode_frame(
        Header {
            program,
            version,
            procedure,
            message_type: MessageType::Stream,
            serial,
            status,
        },
        payload,
    )
}

/// Encode a REPLY frame.
pub fn encode_reply(program: u32, version: u32, procedure: u32, serial: u32, status: Status, payload: &[u8]) -> Result<Vec<u8>> {
    encode_frame(
        Header {
            program,
            version,
            procedure,
            message_type: MessageType::Reply,
            serial,
            status,
        },
        payload,
    )
}

/// Encode an arbitrary header + payload. `encode_request`/`encode_stream`/
/// `encode_reply` are thin convenience wrappers around this for the three
/// fixed message shapes; `connection.rs` uses this directly when the
/// message type and status are chosen dynamically (e.g. fire-and-forget
/// stream sends).
pub fn encode_frame(header: Header, payload: &[u8]) -> Result<Vec<u8>> {
    let total = LENGTH_SIZE + HEADER_SIZE + payload.len();
    if total > MAX_FRAME_LENGTH as usize {
        return Err(Error::protocol(format!(
            "encoded frame of {total} bytes exceeds maximum of {MAX_FRAME_LENGTH}"
        )));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&header.program.to_be_bytes());
    buf.extend_from_slice(&header.version.to_be_bytes());
    buf.extend_from_slice(&header.procedure.to_be_bytes());
    buf.extend_from_slice(&header.message_type.to_wire().to_be_bytes());
    buf.extend_from_slice(&header.serial.to_be_bytes());
    buf.extend_from_slice(&header.status.to_wire().to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode the length prefix alone, validating it against `HEADER_SIZE` and
/// `MAX_FRAME_LENGTH` without touching anything past the first four bytes.
pub fn decode_length(bytes: &[u8; LENGTH_SIZE]) -> Result<u32> {
    let length = u32::from_be_bytes(*bytes);
    if (length as usize) < LENGTH_SIZE + HEADER_SIZE {
        return Err(Error::protocol(format!(
            "declared frame length {length} is smaller than the minimum frame size"
        )));
    }
    if length > MAX_FRAME_LENGTH {
        return Err(Error::protocol(format!(
            "declared frame length {length} exceeds maximum of {MAX_FRAME_LENGTH}"
        )));
    }
    Ok(length)
}

/// Decode the fixed header from the bytes following the length prefix.
/// `bytes` must be exactly `HEADER_SIZE` long.
pub fn decode_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() != HEADER_SIZE {
        return Err(Error::protocol(format!(
            "header buffer is {} bytes, expected {HEADER_SIZE}",
            bytes.len()
        )));
    }

    let read_u32 = |offset: usize| -> u32 { u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) };

    Ok(Header {
        program: read_u32(0),
        version: read_u32(4),
        procedure: read_u32(8),
        message_type: MessageType::from_wire(read_u32(12))?,
        serial: read_u32(16),
        status: Status::from_wire(read_u32(20))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_call_with_no_payload() {
        let frame = encode_request(1, 1, 66, 1, &[]).unwrap();
        // length(4) + header(24) + payload(0)
        assert_eq!(frame.len(), 28);
        assert_eq!(&frame[0..4], &28u32.to_be_bytes());

        let length = decode_length(frame[0..4].try_into().unwrap()).unwrap();
        assert_eq!(length as usize, frame.len());

        let header = decode_header(&frame[4..28]).unwrap();
        assert_eq!(header.program, 1);
        assert_eq!(header.procedure, 66);
        assert_eq!(header.message_type, MessageType::Call);
        assert_eq!(header.serial, 1);
        assert_eq!(header.status, Status::Ok);
    }

    #[test]
    fn round_trips_a_stream_continue_with_payload() {
        let payload = vec![0x42u8; 4096];
        let frame = encode_stream(1, 1, 70, 9, Status::Continue, &payload).unwrap();
        assert_eq!(frame.len(), LENGTH_SIZE + HEADER_SIZE + 4096);

        let header = decode_header(&frame[4..28]).unwrap();
        assert_eq!(header.message_type, MessageType::Stream);
        assert_eq!(header.status, Status::Continue);
        assert_eq!(&frame[28..], payload.as_slice());
    }

    #[test]
    fn rejects_declared_length_below_minimum() {
        let bad = (HEADER_SIZE as u32 - 1).to_be_bytes();
        assert!(decode_length(&bad).is_err());
    }

    #[test]
    fn rejects_declared_length_above_maximum() {
        let bad = 0xFFFF_FFFFu32.to_be_bytes();
        let err = decode_length(&bad).unwrap_err();
        match err {
            Error::Protocol(_) => {}
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[12..16].copy_from_slice(&99u32.to_be_bytes());
        assert!(decode_header(&bytes).is_err());
    }

    #[test]
    fn encode_refuses_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_LENGTH as usize];
        let err = encode_request(1, 1, 1, 1, &payload).unwrap_err();
        match err {
            Error::Protocol(_) => {}
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }
}
