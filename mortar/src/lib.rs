//! # Mortar
//!
//! Multiplexed, optionally TLS-secured RPC transport built on tokio.
//!
//! Mortar provides:
//! - **Concurrent calls on one connection**: requests are correlated with
//!   responses by conversation id and may complete in any order
//! - **TLS 1.3** via rustls, with optional mutual authentication and
//!   application certificate validation callbacks
//! - **Layer stacks**: per-connection middleware over out-of-band layer data
//! - **Pluggable resolution**: system, static, caching, or DNS resolvers
//!
//! ## Quick Start
//!
//! ```rust
//! use mortar::{Context, Endpoint, DEFAULT_SECURE_PORT};
//! use std::time::Duration;
//!
//! let endpoint: Endpoint = "mortars://example.com".parse().unwrap();
//! assert!(endpoint.use_tls());
//! assert_eq!(endpoint.port(), DEFAULT_SECURE_PORT);
//!
//! // Context with timeout
//! let ctx = Context::with_timeout(Duration::from_secs(30));
//! assert!(ctx.deadline.is_some());
//! ```
//!
//! ## Features
//!
//! - `tracing` (default) - `TracingLayer` for trace-id propagation
//! - `dns` - `DnsResolver` backed by hickory
//! - `full` - Enable all features
//!
//! ## Architecture
//!
//! Mortar is composed of several crates:
//!
//! - [`mortar-core`] - Errors, context, message kinds, dispatcher contract
//! - [`mortar-codec`] - Frame and framelet wire codec
//! - [`mortar-layers`] - Layer stack middleware
//! - [`mortar-resolver`] - Host name resolution
//! - [`mortar-transport`] - Connections, listeners, TLS

// Re-export core types
pub use mortar_core::{
    BoxFuture, CodecError, Context, Dispatcher, IncomingRequest, LayerData, MessageKind,
    MortarError, NullDispatcher, RpcError, TraceId, TransportError,
};

// Re-export codec
pub use mortar_codec::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameCodec};

// Re-export layers
pub use mortar_layers::{Layer, LayerError, LayerStack, LayerStackProvider, StaticLayerStackProvider};

#[cfg(feature = "tracing")]
pub use mortar_layers::{TRACE_ID_KEY, TracingLayer};

// Re-export resolvers
pub use mortar_resolver::{CachingResolver, ResolveError, Resolver, StaticResolver, SystemResolver};

#[cfg(feature = "dns")]
pub use mortar_resolver::DnsResolver;

// Re-export transport
pub use mortar_transport::{
    CertificateCheck, CertificateValidator, Connection, ConnectionId, ConnectionState,
    DEFAULT_INSECURE_PORT, DEFAULT_SECURE_PORT, Endpoint, EndpointError, Listener, SecureStream,
    Side, TimeoutConfig, TlsClientConfig, TlsServerConfig, Transport, TransportBuilder,
    TransportConfig,
};

pub use bytes::Bytes;

/// Prelude module for convenient imports.
///
/// ```rust
/// use mortar::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Bytes, Connection, Context, Dispatcher, Endpoint, IncomingRequest, Listener, MortarError,
        RpcError, Transport, TransportError,
    };
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
