//! Trace-id propagation layer.

use mortar_core::{LayerData, MessageKind, TraceId};

use crate::layer::{Layer, LayerError};

/// Layer data key holding the 16-byte trace id.
pub const TRACE_ID_KEY: &str = "trace-id";

/// Layer data key holding the sending service name.
const SERVICE_KEY: &str = "service";

/// Layer for distributed tracing integration.
///
/// This layer:
/// - Stamps a trace id into outgoing requests and events that lack one
/// - Tags outgoing frames with the local service name
/// - Logs the trace id of every received frame at debug level
///
/// ## Example
///
/// ```rust
/// use mortar_layers::{LayerStack, TracingLayer};
///
/// let stack = LayerStack::new().with(TracingLayer::new("greeter"));
/// assert_eq!(stack.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct TracingLayer {
    service_name: String,
}

impl TracingLayer {
    /// Create a new tracing layer.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

fn trace_id(layer_data: &LayerData) -> Option<TraceId> {
    layer_data.get(TRACE_ID_KEY).and_then(TraceId::from_slice)
}

impl Layer for TracingLayer {
    fn on_send(&self, kind: MessageKind, layer_data: &mut LayerData) -> Result<(), LayerError> {
        if kind.carries_headers() && trace_id(layer_data).is_none() {
            layer_data.insert(TRACE_ID_KEY, TraceId::new().as_bytes().to_vec());
        }
        layer_data.insert(SERVICE_KEY, self.service_name.as_bytes());

        if let Some(trace_id) = trace_id(layer_data) {
            tracing::debug!(%trace_id, %kind, service = %self.service_name, "sending frame");
        }
        Ok(())
    }

    fn on_receive(&self, kind: MessageKind, layer_data: &LayerData) -> Result<(), LayerError> {
        let trace_id = trace_id(layer_data)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let peer = layer_data.get_str(SERVICE_KEY).unwrap_or("unknown");

        tracing::debug!(%trace_id, %kind, peer, "received frame");
        Ok(())
    }
}
