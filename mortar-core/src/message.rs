//! Message kinds and framelet payload types.
//!
//! Everything that travels inside a framelet other than the application
//! payload is serialized with rkyv. Decoding copies the framelet into an
//! aligned buffer first, then validates and deserializes it.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::CodecError;

/// Version carried in the connection `Config` exchange.
pub const PROTOCOL_VERSION: u32 = 1;

/// Kind tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Two-way request expecting exactly one response or error.
    Request = 1,

    /// Successful response to a request.
    Response = 2,

    /// One-way message, never answered.
    Event = 3,

    /// Error response to a request.
    Error = 4,

    /// Connection-scope control message, not correlated to any request.
    Control = 5,
}

impl MessageKind {
    /// Short lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Error => "error",
            Self::Control => "control",
        }
    }

    /// Whether frames of this kind carry a headers framelet.
    #[must_use]
    pub const fn carries_headers(self) -> bool {
        matches!(self, Self::Request | Self::Event)
    }

    /// Whether this kind completes an outstanding request.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Event),
            4 => Ok(Self::Error),
            5 => Ok(Self::Control),
            other => Err(CodecError::InvalidFrame(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing headers for request and event frames.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct Headers {
    /// Fully qualified method name.
    pub method: String,
}

impl Headers {
    /// Create headers for a method.
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }
}

/// Out-of-band key/value data owned by the layer stack.
///
/// Keys are kept sorted so the archived form is deterministic.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct LayerData {
    entries: BTreeMap<String, Vec<u8>>,
}

impl LayerData {
    /// Create empty layer data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        self.entries.insert(key.into(), value.into())
    }

    /// Get a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Get a value as UTF-8 text.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Remove a value by key.
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    /// Check whether a key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Error information sent in error responses.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct RpcError {
    /// Error code for programmatic handling.
    pub code: u32,

    /// Human-readable error message.
    pub message: String,

    /// Optional additional details.
    pub details: Option<Vec<u8>>,
}

impl RpcError {
    /// Create a new RPC error.
    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create an error with details.
    #[must_use]
    pub fn with_details(code: u32, message: impl Into<String>, details: Vec<u8>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    // Common error codes
    /// Error code for cancelled requests.
    pub const CANCELLED: u32 = 1;
    /// Error code for unknown errors.
    pub const UNKNOWN: u32 = 2;
    /// Error code for invalid arguments.
    pub const INVALID_ARGUMENT: u32 = 3;
    /// Error code for deadline exceeded.
    pub const DEADLINE_EXCEEDED: u32 = 4;
    /// Error code for not found.
    pub const NOT_FOUND: u32 = 5;
    /// Error code for permission denied.
    pub const PERMISSION_DENIED: u32 = 7;
    /// Error code for resource exhausted.
    pub const RESOURCE_EXHAUSTED: u32 = 8;
    /// Error code for methods with no handler.
    pub const UNIMPLEMENTED: u32 = 12;
    /// Error code for internal errors.
    pub const INTERNAL: u32 = 13;
    /// Error code for unavailable service.
    pub const UNAVAILABLE: u32 = 14;
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Connection-scope control messages.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ControlMessage {
    /// Connection handshake. The client sends it first, the server echoes
    /// its own before any other traffic is expected.
    Config {
        /// Protocol version of the sender.
        version: u32,
    },

    /// The sender hit a protocol violation and is closing the connection.
    ProtocolError {
        /// Machine readable reason.
        code: u32,
        /// Human-readable description.
        details: String,
    },

    /// Orderly close announced by the sender.
    Close,
}

impl ControlMessage {
    /// Frame could not be decoded.
    pub const MALFORMED_FRAME: u32 = 1;
    /// Peer speaks a different protocol version.
    pub const VERSION_MISMATCH: u32 = 3;

    /// The local `Config` message.
    #[must_use]
    pub const fn config() -> Self {
        Self::Config {
            version: PROTOCOL_VERSION,
        }
    }

    /// Build a protocol error message.
    #[must_use]
    pub fn protocol_error(code: u32, details: impl Into<String>) -> Self {
        Self::ProtocolError {
            code,
            details: details.into(),
        }
    }
}

macro_rules! archived_framelet {
    ($($ty:ty),+ $(,)?) => {$(
        impl $ty {
            /// Serialize into framelet bytes.
            pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
                rkyv::to_bytes::<rkyv::rancor::Error>(self)
                    .map(|v| Bytes::from(v.to_vec()))
                    .map_err(|e| CodecError::Serialization(e.to_string()))
            }

            /// Validate and deserialize framelet bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
                let mut aligned: AlignedVec = AlignedVec::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
                    .map_err(|e| CodecError::Deserialization(e.to_string()))
            }
        }
    )+};
}

archived_framelet!(Headers, LayerData, RpcError, ControlMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use rkyv::access;

    #[test]
    fn test_message_kind_from_byte() {
        assert_eq!(MessageKind::try_from(1).unwrap(), MessageKind::Request);
        assert_eq!(MessageKind::try_from(5).unwrap(), MessageKind::Control);
        assert!(matches!(
            MessageKind::try_from(9),
            Err(CodecError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_message_kind_flags() {
        assert!(MessageKind::Request.carries_headers());
        assert!(MessageKind::Event.carries_headers());
        assert!(!MessageKind::Response.carries_headers());
        assert!(MessageKind::Error.is_response());
        assert!(!MessageKind::Control.is_response());
    }

    #[test]
    fn test_layer_data_archived_access() {
        let mut data = LayerData::new();
        data.insert("auth", b"token".to_vec());
        data.insert("trace-id", "abc");

        let bytes = data.to_bytes().unwrap();

        let mut aligned: AlignedVec = AlignedVec::new();
        aligned.extend_from_slice(&bytes);
        let archived = access::<ArchivedLayerData, rkyv::rancor::Error>(&aligned).unwrap();
        assert_eq!(archived.entries.len(), 2);

        let decoded = LayerData::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.get("auth"), Some(&b"token"[..]));
        assert_eq!(decoded.get_str("trace-id"), Some("abc"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = ControlMessage::from_bytes(&[0xff, 0x01]);
        assert!(matches!(result, Err(CodecError::Deserialization(_))));
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::new(RpcError::NOT_FOUND, "no such user");
        assert_eq!(err.to_string(), "[5] no such user");
    }
}
