//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//!
//! ### Request Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Cmd (1)  │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Payload by Request Type
//! - GET:    key_len (4 bytes) + key
//! - PUT:    key_len (4 bytes) + key + JSON value
//! - DELETE: key_len (4 bytes) + key
//! - PING:   empty
//! - JOIN:   node id (8 bytes) + raft address (UTF-8)
//! - REMOVE: node id (8 bytes)
//! - STATS:  empty
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use super::{Request, Response, Status};
use crate::error::{LedgerError, Result};

/// Header size: 1 byte command/status + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Request Encoding/Decoding
// =============================================================================

/// Encode a request to bytes
///
/// Format: cmd_type (1) + payload_len (4) + payload
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut payload = BytesMut::new();
    match request {
        Request::Get { key } | Request::Delete { key } => {
            payload.put_u32(key.len() as u32);
            payload.put_slice(key);
        }
        Request::Put { key, value } => {
            payload.reserve(4 + key.len() + value.len());
            payload.put_u32(key.len() as u32);
            payload.put_slice(key);
            payload.put_slice(value);
        }
        Request::Join { id, addr } => {
            payload.put_u64(*id);
            payload.put_slice(addr.as_bytes());
        }
        Request::Remove { id } => payload.put_u64(*id),
        Request::Ping | Request::Stats => {}
    }

    frame(request.request_type() as u8, &payload)
}

/// Decode a request from bytes
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let (cmd_type, payload) = split_frame(bytes, "request")?;

    match cmd_type {
        0x01 => {
            let mut buf = payload;
            let key = take_key(&mut buf, "GET")?;
            Ok(Request::Get { key })
        }
        0x02 => {
            let mut buf = payload;
            let key = take_key(&mut buf, "PUT")?;
            Ok(Request::Put {
                key,
                value: buf.to_vec(),
            })
        }
        0x03 => {
            let mut buf = payload;
            let key = take_key(&mut buf, "DELETE")?;
            Ok(Request::Delete { key })
        }
        0x04 => expect_empty(payload, "PING").map(|()| Request::Ping),
        0x10 => {
            let mut buf = payload;
            let id = take_node_id(&mut buf, "JOIN")?;
            let addr = std::str::from_utf8(buf)
                .map_err(|_| LedgerError::Protocol("JOIN: address is not UTF-8".to_string()))?
                .to_string();
            Ok(Request::Join { id, addr })
        }
        0x11 => {
            let mut buf = payload;
            let id = take_node_id(&mut buf, "REMOVE")?;
            expect_empty(buf, "REMOVE").map(|()| Request::Remove { id })
        }
        0x12 => expect_empty(payload, "STATS").map(|()| Request::Stats),
        _ => Err(LedgerError::Protocol(format!(
            "Unknown command type: 0x{:02x}",
            cmd_type
        ))),
    }
}

fn take_key(buf: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(LedgerError::Protocol(format!(
            "{} command: missing key length",
            what
        )));
    }
    let key_len = buf.get_u32() as usize;

    if buf.remaining() < key_len {
        return Err(LedgerError::Protocol(format!(
            "{} command: incomplete key (expected {}, got {})",
            what,
            key_len,
            buf.remaining()
        )));
    }
    let key = buf[..key_len].to_vec();
    buf.advance(key_len);
    Ok(key)
}

fn take_node_id(buf: &mut &[u8], what: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(LedgerError::Protocol(format!(
            "{} command: missing node id",
            what
        )));
    }
    Ok(buf.get_u64())
}

fn expect_empty(payload: &[u8], what: &str) -> Result<()> {
    if !payload.is_empty() {
        return Err(LedgerError::Protocol(format!(
            "{} command: unexpected payload of {} bytes",
            what,
            payload.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response to bytes
///
/// Format: status (1) + payload_len (4) + payload
pub fn encode_response(response: &Response) -> Vec<u8> {
    let payload = response.payload.as_deref().unwrap_or(&[]);
    frame(response.status as u8, payload)
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let (status_byte, payload) = split_frame(bytes, "response")?;

    let status = match status_byte {
        0x00 => Status::Ok,
        0x01 => Status::NotFound,
        0x02 => Status::Error,
        0x03 => Status::NotLeader,
        _ => {
            return Err(LedgerError::Protocol(format!(
                "Unknown response status: 0x{:02x}",
                status_byte
            )))
        }
    };

    let payload = if payload.is_empty() {
        None
    } else {
        Some(payload.to_vec())
    };

    Ok(Response { status, payload })
}

// =============================================================================
// Framing
// =============================================================================

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut message = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    message.put_u8(tag);
    message.put_u32(payload.len() as u32);
    message.put_slice(payload);
    message.to_vec()
}

/// Validate the header and return (tag, payload)
fn split_frame<'a>(bytes: &'a [u8], what: &str) -> Result<(u8, &'a [u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(LedgerError::Protocol(format!(
            "Incomplete {} header: expected {} bytes, got {}",
            what,
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let mut header = &bytes[..HEADER_SIZE];
    let tag = header.get_u8();
    let payload_len = header.get_u32() as usize;
    check_payload_len(payload_len)?;

    let total_len = HEADER_SIZE + payload_len;
    if bytes.len() < total_len {
        return Err(LedgerError::Protocol(format!(
            "Incomplete {} payload: expected {} bytes, got {}",
            what,
            total_len,
            bytes.len()
        )));
    }

    Ok((tag, &bytes[HEADER_SIZE..total_len]))
}

fn check_payload_len(payload_len: usize) -> Result<()> {
    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(LedgerError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read one whole frame (header + payload) from a stream
fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    check_payload_len(payload_len)?;

    let mut message = vec![0u8; HEADER_SIZE + payload_len];
    message[..HEADER_SIZE].copy_from_slice(&header);
    if payload_len > 0 {
        reader.read_exact(&mut message[HEADER_SIZE..])?;
    }
    Ok(message)
}

/// Read a complete request from a stream
///
/// Blocks until a complete request is received or an error occurs
pub fn read_request<R: Read>(reader: &mut R) -> Result<Request> {
    decode_request(&read_frame(reader)?)
}

/// Write a request to a stream
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<()> {
    writer.write_all(&encode_request(request))?;
    writer.flush()?;
    Ok(())
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    decode_response(&read_frame(reader)?)
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    writer.write_all(&encode_response(response))?;
    writer.flush()?;
    Ok(())
}
