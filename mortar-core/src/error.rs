//! Error types for the Mortar RPC transport.

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Main error type returned to callers of a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MortarError {
    /// Transport-level error (connection, IO, TLS, etc.)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Codec error (framing, serialization)
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error response returned by the remote dispatcher
    #[error("service error [{code}]: {message}")]
    Service {
        /// Error code for programmatic handling
        code: u32,
        /// Human-readable error message
        message: String,
    },

    /// A layer rejected the message on this or the remote side
    #[error("layer error [{code}]: {message}")]
    Layer {
        /// Error code reported by the layer
        code: u32,
        /// Human-readable error message
        message: String,
    },

    /// Request timed out
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Request was cancelled
    #[error("request cancelled")]
    Cancelled,
}

/// Transport-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// IO error from the underlying socket
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// Connection is closed, or closed while the call was outstanding
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to connect to the remote endpoint
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Host resolution failed or yielded no addresses
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// TLS handshake failed
    #[error("tls authentication failed: {0}")]
    TlsAuthentication(String),

    /// Server demanded a client certificate but none was presented
    #[error("mutual authentication required")]
    MutualAuthenticationRequired,

    /// Malformed or unexpected frame, or a protocol error reported by the peer
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Stream was accessed after it was shut down
    #[error("stream used after shutdown")]
    UseAfterShutdown,

    /// Address could not be parsed as an endpoint
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Layer stack could not be resolved for a connection
    #[error("layer stack error: {0}")]
    LayerStack(String),
}

/// Codec errors for framing and serialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Frame size exceeds maximum allowed
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Invalid frame format
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// rkyv serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// rkyv deserialization/validation failed
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error while reading frames
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl MortarError {
    /// Create a service error with code and message.
    #[must_use]
    pub fn service(code: u32, message: impl Into<String>) -> Self {
        Self::Service {
            code,
            message: message.into(),
        }
    }

    /// Check if this error is retryable on a fresh connection.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(TransportError::Io(_)) => true,
            Self::Transport(TransportError::ConnectionClosed) => true,
            Self::Transport(TransportError::ConnectionFailed(_)) => true,
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the connection is no longer usable.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::ConnectionClosed)
                | Self::Transport(TransportError::Io(_))
                | Self::Transport(TransportError::Protocol(_))
                | Self::Transport(TransportError::UseAfterShutdown)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MortarError::service(404, "user not found");
        assert_eq!(err.to_string(), "service error [404]: user not found");

        let err = MortarError::from(TransportError::MutualAuthenticationRequired);
        assert_eq!(
            err.to_string(),
            "transport error: mutual authentication required"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(MortarError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(MortarError::from(TransportError::ConnectionClosed).is_retryable());
        assert!(!MortarError::Cancelled.is_retryable());
        assert!(!MortarError::from(TransportError::MutualAuthenticationRequired).is_retryable());
    }

    #[test]
    fn test_connection_error() {
        assert!(MortarError::from(TransportError::Protocol("bad kind".into())).is_connection_error());
        assert!(!MortarError::service(5, "missing").is_connection_error());
    }

    #[test]
    fn test_io_conversion() {
        let err = CodecError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(err, CodecError::Io(_)));
    }
}
