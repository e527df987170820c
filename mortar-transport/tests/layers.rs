mod common;

use std::time::Duration;

use bytes::Bytes;
use mortar_core::{Context, LayerData, MessageKind, MortarError, RpcError};
use mortar_layers::{Layer, LayerError, LayerStack};
use mortar_transport::Transport;
use tokio::sync::mpsc::error::TryRecvError;

use common::{TestDispatcher, start_listener};

/// Adds `user` to outgoing requests.
struct Stamp(&'static str);

impl Layer for Stamp {
    fn on_send(&self, kind: MessageKind, data: &mut LayerData) -> Result<(), LayerError> {
        if kind == MessageKind::Request {
            data.insert("user", self.0);
        }
        Ok(())
    }
}

/// Refuses inbound requests without a `token`.
struct RequireToken;

impl Layer for RequireToken {
    fn on_receive(&self, kind: MessageKind, data: &LayerData) -> Result<(), LayerError> {
        if kind == MessageKind::Request && !data.contains_key("token") {
            return Err(LayerError::Rejected("missing token".into()));
        }
        Ok(())
    }
}

/// Refuses to send frames of one kind.
struct BlockSend(MessageKind);

impl Layer for BlockSend {
    fn on_send(&self, kind: MessageKind, _data: &mut LayerData) -> Result<(), LayerError> {
        if kind == self.0 {
            return Err(LayerError::Internal(format!("{kind} blocked")));
        }
        Ok(())
    }
}

/// Refuses to accept frames of one kind.
struct BlockReceive(MessageKind);

impl Layer for BlockReceive {
    fn on_receive(&self, kind: MessageKind, _data: &LayerData) -> Result<(), LayerError> {
        if kind == self.0 {
            return Err(LayerError::Rejected(format!("{kind} refused")));
        }
        Ok(())
    }
}

fn server(stack: Option<LayerStack>) -> Transport {
    let builder = Transport::builder().dispatcher(TestDispatcher::new());
    match stack {
        Some(stack) => builder.layer_stack(stack).build(),
        None => builder.build(),
    }
}

#[tokio::test]
async fn test_send_layer_data_reaches_dispatcher() {
    let server = server(None);
    let (_listener, addr) = start_listener(&server).await;

    let client = Transport::builder()
        .layer_stack(LayerStack::new().with(Stamp("alice")))
        .build();
    let conn = client.connect(&format!("mortar://{addr}")).await.unwrap();

    let reply = conn
        .send_request(&Context::new(), "layer", Bytes::new())
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"alice"));
    server.stop().await;
}

#[tokio::test]
async fn test_context_layer_data_without_stack() {
    let server = server(None);
    let (_listener, addr) = start_listener(&server).await;

    let client = Transport::builder().build();
    let conn = client.connect(&format!("mortar://{addr}")).await.unwrap();

    let ctx = Context::new().with_layer_data("user", "bob");
    let reply = conn.send_request(&ctx, "layer", Bytes::new()).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"bob"));
    server.stop().await;
}

#[tokio::test]
async fn test_receive_rejection_answers_request() {
    let server = server(Some(LayerStack::new().with(RequireToken)));
    let (_listener, addr) = start_listener(&server).await;

    let client = Transport::builder().build();
    let conn = client.connect(&format!("mortar://{addr}")).await.unwrap();

    let err = conn
        .send_request(&Context::new(), "echo", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MortarError::Service { code: RpcError::PERMISSION_DENIED, .. }
    ));

    let ctx = Context::new().with_layer_data("token", "secret");
    let reply = conn
        .send_request(&ctx, "echo", Bytes::from_static(b"let in"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"let in"));
    server.stop().await;
}

#[tokio::test]
async fn test_send_rejection_fails_call() {
    let (dispatcher, mut events) = TestDispatcher::with_events();
    let server = Transport::builder().dispatcher(dispatcher).build();
    let (_listener, addr) = start_listener(&server).await;

    let client = Transport::builder()
        .layer_stack(LayerStack::new().with(BlockSend(MessageKind::Event)))
        .build();
    let conn = client.connect(&format!("mortar://{addr}")).await.unwrap();

    let err = conn
        .send_event(&Context::new(), "audit", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MortarError::Layer { code: RpcError::INTERNAL, .. }
    ));

    // Requests still flow, and the blocked event never reached the peer
    assert!(
        conn.send_request(&Context::new(), "echo", Bytes::new())
            .await
            .is_ok()
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    server.stop().await;
}

#[tokio::test]
async fn test_response_rejected_by_server_layer() {
    let server = server(Some(LayerStack::new().with(BlockSend(MessageKind::Response))));
    let (_listener, addr) = start_listener(&server).await;

    let client = Transport::builder().build();
    let conn = client.connect(&format!("mortar://{addr}")).await.unwrap();

    let err = conn
        .send_request(&Context::new(), "echo", Bytes::new())
        .await
        .unwrap_err();
    match err {
        MortarError::Service { code, message } => {
            assert_eq!(code, RpcError::INTERNAL);
            assert!(message.contains("blocked"));
        }
        other => panic!("unexpected error: {other}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn test_response_rejected_by_client_layer() {
    let server = server(None);
    let (_listener, addr) = start_listener(&server).await;

    let client = Transport::builder()
        .layer_stack(LayerStack::new().with(BlockReceive(MessageKind::Response)))
        .build();
    let conn = client.connect(&format!("mortar://{addr}")).await.unwrap();

    let err = conn
        .send_request(&Context::new(), "echo", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MortarError::Layer { code: RpcError::PERMISSION_DENIED, .. }
    ));
    assert_eq!(conn.pending_requests(), 0);
    server.stop().await;
}
