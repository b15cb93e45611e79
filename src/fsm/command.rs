//! Replicated command payload
//!
//! Commands travel through the log as JSON:
//! `{"operation": "SET", "key": "k", "value": <any JSON>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Operations the state machine dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Set,
    Get,
    Delete,
}

impl OpKind {
    /// Parse an operation name, ignoring case and surrounding whitespace
    pub fn parse(operation: &str) -> Option<Self> {
        match operation.trim().to_ascii_uppercase().as_str() {
            "SET" => Some(OpKind::Set),
            "GET" => Some(OpKind::Get),
            "DELETE" => Some(OpKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Set => "SET",
            OpKind::Get => "GET",
            OpKind::Delete => "DELETE",
        }
    }
}

/// A command as stored in a log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub operation: String,
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

impl Command {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self::new(OpKind::Set, key, value)
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(OpKind::Get, key, Value::Null)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(OpKind::Delete, key, Value::Null)
    }

    fn new(kind: OpKind, key: impl Into<String>, value: Value) -> Self {
        Self {
            operation: kind.as_str().to_string(),
            key: key.into(),
            value,
        }
    }

    /// Normalized operation, `None` if unrecognized
    pub fn kind(&self) -> Option<OpKind> {
        OpKind::parse(&self.operation)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_is_case_and_space_insensitive() {
        assert_eq!(OpKind::parse("set"), Some(OpKind::Set));
        assert_eq!(OpKind::parse("SET"), Some(OpKind::Set));
        assert_eq!(OpKind::parse(" Set "), Some(OpKind::Set));
        assert_eq!(OpKind::parse("delete\n"), Some(OpKind::Delete));
        assert_eq!(OpKind::parse("PATCH"), None);
        assert_eq!(OpKind::parse(""), None);
    }

    #[test]
    fn test_wire_shape() {
        let bytes = Command::set("key0", json!("value0")).encode().unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            raw,
            json!({"operation": "SET", "key": "key0", "value": "value0"})
        );
    }

    #[test]
    fn test_missing_value_defaults_to_null() {
        let cmd = Command::decode(br#"{"operation":"get","key":"a"}"#).unwrap();
        assert_eq!(cmd.kind(), Some(OpKind::Get));
        assert_eq!(cmd.value, Value::Null);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Command::decode(b"not json").is_err());
        assert!(Command::decode(br#"{"key":"a"}"#).is_err());
    }
}
