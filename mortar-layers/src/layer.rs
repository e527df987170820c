//! Layer trait and stack implementation.

use std::sync::Arc;

use mortar_core::{LayerData, MessageKind, MortarError, RpcError};

/// Error type for layer operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayerError {
    /// The layer refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// Layer internal error.
    #[error("layer error: {0}")]
    Internal(String),
}

impl LayerError {
    /// Code sent to the peer when this error answers a request.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Rejected(_) => RpcError::PERMISSION_DENIED,
            Self::Internal(_) => RpcError::INTERNAL,
        }
    }

    /// Error response payload for this error.
    #[must_use]
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::new(self.code(), self.to_string())
    }
}

impl From<LayerError> for MortarError {
    fn from(err: LayerError) -> Self {
        MortarError::Layer {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Middleware invoked around every frame a connection sends or receives.
///
/// Layers see only the message kind and the layer data; the payload stays
/// opaque. Returning an error aborts the frame.
///
/// ## Example
///
/// ```rust
/// use mortar_core::{LayerData, MessageKind};
/// use mortar_layers::{Layer, LayerError};
///
/// struct AuthLayer {
///     token: Vec<u8>,
/// }
///
/// impl Layer for AuthLayer {
///     fn on_send(&self, _kind: MessageKind, data: &mut LayerData) -> Result<(), LayerError> {
///         data.insert("auth", self.token.clone());
///         Ok(())
///     }
///
///     fn on_receive(&self, kind: MessageKind, data: &LayerData) -> Result<(), LayerError> {
///         if kind == MessageKind::Request && data.get("auth") != Some(self.token.as_slice()) {
///             return Err(LayerError::Rejected("bad token".into()));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Layer: Send + Sync + 'static {
    /// Called before a frame is written.
    ///
    /// The layer may add, change, or remove layer data entries.
    fn on_send(&self, kind: MessageKind, layer_data: &mut LayerData) -> Result<(), LayerError> {
        let _ = (kind, layer_data);
        Ok(())
    }

    /// Called after a frame is read, before it reaches the application
    /// or a waiting caller.
    fn on_receive(&self, kind: MessageKind, layer_data: &LayerData) -> Result<(), LayerError> {
        let _ = (kind, layer_data);
        Ok(())
    }
}

/// An ordered stack of layers.
///
/// Layers run in order for outgoing frames (first to last)
/// and in reverse order for incoming frames (last to first).
/// The first error stops the walk.
#[derive(Clone, Default)]
pub struct LayerStack {
    layers: Vec<Arc<dyn Layer>>,
}

impl LayerStack {
    /// Create a new empty layer stack.
    #[must_use]
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Add a layer on top of the stack.
    #[must_use]
    pub fn with(mut self, layer: impl Layer) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Add a shared layer on top of the stack.
    #[must_use]
    pub fn with_shared(mut self, layer: Arc<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Run an outgoing frame's layer data through all layers.
    pub fn on_send(&self, kind: MessageKind, layer_data: &mut LayerData) -> Result<(), LayerError> {
        for layer in &self.layers {
            layer.on_send(kind, layer_data)?;
        }
        Ok(())
    }

    /// Run an incoming frame's layer data through all layers (in reverse order).
    pub fn on_receive(&self, kind: MessageKind, layer_data: &LayerData) -> Result<(), LayerError> {
        for layer in self.layers.iter().rev() {
            layer.on_receive(kind, layer_data)?;
        }
        Ok(())
    }

    /// Check if the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Get the number of layers in the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }
}

impl std::fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStack")
            .field("layers", &self.layers.len())
            .finish()
    }
}
