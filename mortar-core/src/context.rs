//! Per-call context for requests and events.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::message::LayerData;

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Distributed tracing identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    /// Create a new unique trace ID.
    #[must_use]
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let seq = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        bytes[..8].copy_from_slice(&nanos.to_le_bytes());
        bytes[8..].copy_from_slice(&seq.to_le_bytes());
        Self(bytes)
    }

    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice of exactly 16 bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 16]>::try_from(bytes).ok().map(Self)
    }

    /// Get the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Context carried by every outgoing request or event.
///
/// Every call carries:
/// - An optional deadline; expiry fails the call with `Timeout`
/// - An optional cancellation token; cancelling fails the call with `Cancelled`
/// - Initial layer data, handed to the layer stack before the frame is sent
///
/// Neither expiry nor cancellation recalls a frame that was already written.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Absolute deadline for the call.
    /// If `None`, the call waits until answered or the connection closes.
    pub deadline: Option<Instant>,

    /// Cancellation signal for the call.
    pub cancellation: Option<CancellationToken>,

    /// Layer data the layer stack starts from.
    pub layer_data: LayerData,
}

impl Context {
    /// Create a context without deadline or cancellation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with a timeout from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }

    /// Create a context with an absolute deadline.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new().deadline(deadline)
    }

    /// Set the deadline for this context.
    #[must_use]
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a timeout from now.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Add an entry to the initial layer data.
    #[must_use]
    pub fn with_layer_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.layer_data.insert(key, value);
        self
    }

    /// Get remaining time until deadline.
    /// Returns `None` if no deadline is set or deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .and_then(|d| d.checked_duration_since(Instant::now()))
    }

    /// Check if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Check if the call was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}
