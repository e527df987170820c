//! # mortar-transport
//!
//! Connections, listeners, and TLS for the Mortar RPC transport.
//!
//! This crate provides:
//! - `Transport` - factory for client connections and listeners
//! - `Connection` - multiplexed request/response and events over one socket
//! - `Listener` - accepts sockets and owns the resulting connections
//! - `SecureStream` - plain or TLS stream with idempotent shutdown
//! - `Endpoint` - `mortar://` and `mortars://` address parsing
//! - `Multiplexer` - request/response correlation
//!
//! ## Features
//!
//! - `dns` - Enable the hickory DNS resolver in `mortar-resolver`
//!
//! ## Metrics
//!
//! Connection and frame counters are recorded through the `metrics` facade;
//! see [`metrics`] for the names.

mod connection;
mod endpoint;
mod keepalive;
mod listener;
pub mod metrics;
mod mux;
mod stream;
mod tls;
mod transport;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use endpoint::{
    DEFAULT_INSECURE_PORT, DEFAULT_SECURE_PORT, Endpoint, EndpointError, INSECURE_SCHEME,
    SECURE_SCHEME, parse_listen_addr,
};
pub use keepalive::{TimeoutConfig, configure_keep_alive};
pub use listener::Listener;
pub use mux::{Multiplexer, Reply, Side};
pub use stream::{NetStream, SecureStream, WritePermit};
pub use tls::{
    CertificateCheck, CertificateValidator, DEFAULT_HANDSHAKE_TIMEOUT, TlsClientConfig,
    TlsClientConfigBuilder, TlsServerConfig, TlsServerConfigBuilder, load_certs, load_crls,
    load_private_key, load_root_certs, server_name,
};
pub use transport::{Transport, TransportBuilder, TransportConfig};
