//! Response definitions
//!
//! Represents responses to clients.

use crate::error::LedgerError;

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    NotFound = 0x01,
    Error = 0x02,
    NotLeader = 0x03,
}

/// A response to send to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code
    pub status: Status,

    /// Optional payload (JSON value, stats, error message or leader address)
    pub payload: Option<Vec<u8>>,
}

impl Response {
    /// Create an OK response with optional payload
    pub fn ok(payload: Option<Vec<u8>>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    /// Create a NOT_FOUND response
    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: None,
        }
    }

    /// Create an ERROR response
    pub fn error(message: &str) -> Self {
        Self {
            status: Status::Error,
            payload: Some(message.as_bytes().to_vec()),
        }
    }

    /// Create a NOT_LEADER response; the payload is empty when no leader is known
    pub fn not_leader(leader: Option<&str>) -> Self {
        Self {
            status: Status::NotLeader,
            payload: leader.map(|addr| addr.as_bytes().to_vec()),
        }
    }

    /// Map a failed operation to what the client sees
    pub fn from_error(err: &LedgerError) -> Self {
        match err {
            LedgerError::NotLeader { leader } => Self::not_leader(leader.as_deref()),
            other => Self::error(&other.to_string()),
        }
    }

    /// Payload as text, for messages and addresses
    pub fn payload_str(&self) -> Option<String> {
        self.payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }
}
