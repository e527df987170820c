//! Contract between a connection and the application receiving its messages.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use bytes::Bytes;

use crate::message::{LayerData, RpcError};

/// Boxed future returned by object-safe async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An inbound request or event after the layer stack accepted it.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Method named in the frame headers.
    pub method: String,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Layer data as received, after the layer stack ran.
    pub layer_data: LayerData,

    /// Address of the peer that sent the message.
    pub remote_addr: SocketAddr,
}

/// Receives requests and events from a connection.
///
/// Requests are dispatched on their own task, so a slow handler never
/// stalls the connection's reader. Each request gets exactly one answer:
/// the payload on `Ok`, an error response on `Err`.
///
/// ## Example
///
/// ```rust
/// use bytes::Bytes;
/// use mortar_core::{BoxFuture, Dispatcher, IncomingRequest, RpcError};
///
/// struct Echo;
///
/// impl Dispatcher for Echo {
///     fn dispatch(&self, request: IncomingRequest) -> BoxFuture<'_, Result<Bytes, RpcError>> {
///         Box::pin(async move { Ok(request.payload) })
///     }
/// }
/// ```
pub trait Dispatcher: Send + Sync + 'static {
    /// Handle a two-way request.
    fn dispatch(&self, request: IncomingRequest) -> BoxFuture<'_, Result<Bytes, RpcError>>;

    /// Handle a one-way event.
    fn notify(&self, event: IncomingRequest) -> BoxFuture<'_, ()> {
        let _ = event;
        Box::pin(std::future::ready(()))
    }
}

/// Dispatcher that answers every request with `UNIMPLEMENTED`.
///
/// Used when a transport is built without a dispatcher, so a peer
/// calling into a client-only endpoint still gets an answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn dispatch(&self, request: IncomingRequest) -> BoxFuture<'_, Result<Bytes, RpcError>> {
        Box::pin(async move {
            Err(RpcError::new(
                RpcError::UNIMPLEMENTED,
                format!("no handler for method '{}'", request.method),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str) -> IncomingRequest {
        IncomingRequest {
            method: method.to_string(),
            payload: Bytes::from_static(b"ping"),
            layer_data: LayerData::new(),
            remote_addr: "127.0.0.1:1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_null_dispatcher_rejects() {
        let err = NullDispatcher.dispatch(request("svc.Method")).await.unwrap_err();
        assert_eq!(err.code, RpcError::UNIMPLEMENTED);
        assert!(err.message.contains("svc.Method"));
    }

    #[tokio::test]
    async fn test_default_notify_is_noop() {
        NullDispatcher.notify(request("svc.Event")).await;
    }
}
