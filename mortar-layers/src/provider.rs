//! Per-connection layer stack resolution.

use std::sync::Arc;

use crate::layer::{LayerError, LayerStack};

/// Resolves the layer stack a connection runs.
///
/// Called once per connection with the transport-chosen connection id,
/// before the connection exchanges any frame. `Ok(None)` means the
/// connection runs without layers and sends no layer data framelet.
/// An error aborts the connection attempt.
pub trait LayerStackProvider: Send + Sync + 'static {
    /// Resolve the stack for a connection.
    fn layer_stack(&self, unique_id: &str) -> Result<Option<Arc<LayerStack>>, LayerError>;
}

/// Provider that hands every connection the same stack.
#[derive(Debug, Clone)]
pub struct StaticLayerStackProvider {
    stack: Arc<LayerStack>,
}

impl StaticLayerStackProvider {
    /// Create a provider for a shared stack.
    #[must_use]
    pub fn new(stack: LayerStack) -> Self {
        Self {
            stack: Arc::new(stack),
        }
    }
}

impl LayerStackProvider for StaticLayerStackProvider {
    fn layer_stack(&self, _unique_id: &str) -> Result<Option<Arc<LayerStack>>, LayerError> {
        Ok(Some(Arc::clone(&self.stack)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;

    struct Noop;

    impl Layer for Noop {}

    /// Refuses connections whose id ends in an odd digit.
    struct EvenOnly;

    impl LayerStackProvider for EvenOnly {
        fn layer_stack(&self, unique_id: &str) -> Result<Option<Arc<LayerStack>>, LayerError> {
            let last = unique_id.chars().last().and_then(|c| c.to_digit(10));
            match last {
                Some(d) if d % 2 == 0 => Ok(None),
                _ => Err(LayerError::Rejected(format!("{unique_id} refused"))),
            }
        }
    }

    #[test]
    fn test_static_provider_shares_stack() {
        let provider = StaticLayerStackProvider::new(LayerStack::new().with(Noop));

        let a = provider.layer_stack("conn-1").unwrap().unwrap();
        let b = provider.layer_stack("conn-2").unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_provider_keyed_by_id() {
        let provider: Arc<dyn LayerStackProvider> = Arc::new(EvenOnly);
        assert!(provider.layer_stack("conn-2").unwrap().is_none());
        assert!(provider.layer_stack("conn-3").is_err());
    }
}
