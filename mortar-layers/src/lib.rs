//! # mortar-layers
//!
//! Layer stack middleware for the Mortar RPC transport.
//!
//! This crate provides:
//! - `Layer` trait, invoked on every frame a connection sends or receives
//! - `LayerStack`, the ordered pipeline a connection runs
//! - `LayerStackProvider`, resolving a stack once per connection
//! - `TracingLayer` for trace-id propagation (with `tracing` feature)

mod layer;
mod provider;

#[cfg(feature = "tracing")]
mod tracing_layer;

pub use layer::{Layer, LayerError, LayerStack};
pub use provider::{LayerStackProvider, StaticLayerStackProvider};

#[cfg(feature = "tracing")]
pub use tracing_layer::{TRACE_ID_KEY, TracingLayer};
