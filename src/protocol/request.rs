//! Request definitions
//!
//! Represents requests from clients.

/// Request types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Get = 0x01,
    Put = 0x02,
    Delete = 0x03,
    Ping = 0x04,
    Join = 0x10,
    Remove = 0x11,
    Stats = 0x12,
}

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Get a value by key
    Get { key: Vec<u8> },

    /// Store a JSON value under a key
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key
    Delete { key: Vec<u8> },

    /// Ping (health check)
    Ping,

    /// Add a node to the cluster as a voter
    Join { id: u64, addr: String },

    /// Remove a node from the cluster
    Remove { id: u64 },

    /// Node status as JSON
    Stats,
}

impl Request {
    /// Get the request type
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Get { .. } => RequestType::Get,
            Request::Put { .. } => RequestType::Put,
            Request::Delete { .. } => RequestType::Delete,
            Request::Ping => RequestType::Ping,
            Request::Join { .. } => RequestType::Join,
            Request::Remove { .. } => RequestType::Remove,
            Request::Stats => RequestType::Stats,
        }
    }
}
