//! # mortar-core
//!
//! Core types, traits, and error definitions for the Mortar RPC transport.
//!
//! This crate provides:
//! - Error types (`MortarError`, `TransportError`, `CodecError`)
//! - Per-call context (`Context`) with deadline and cancellation
//! - Message kinds and the rkyv-archived framelet payloads
//!   (`Headers`, `LayerData`, `RpcError`, `ControlMessage`)
//! - The `Dispatcher` contract the transport hands inbound messages to

mod context;
mod dispatch;
mod error;
mod message;

pub use context::{Context, TraceId};
pub use dispatch::{BoxFuture, Dispatcher, IncomingRequest, NullDispatcher};
pub use error::{CodecError, MortarError, TransportError};
pub use message::{
    ArchivedControlMessage, ArchivedHeaders, ArchivedLayerData, ArchivedRpcError,
    ControlMessage, Headers, LayerData, MessageKind, PROTOCOL_VERSION, RpcError,
};
