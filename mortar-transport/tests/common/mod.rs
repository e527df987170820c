#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use mortar_core::{BoxFuture, Dispatcher, IncomingRequest, RpcError};
use mortar_transport::{Listener, Transport, TransportBuilder};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::mpsc;

/// Test dispatcher.
///
/// * `echo` answers with the payload.
/// * `sleep` expects `<tag>:<millis>`, sleeps, then echoes.
/// * `fail` answers with an `INVALID_ARGUMENT` error.
/// * `layer` answers with the `user` layer data entry.
///
/// Events are forwarded to the channel given at construction.
pub struct TestDispatcher {
    events: Option<mpsc::UnboundedSender<IncomingRequest>>,
}

impl TestDispatcher {
    pub fn new() -> Self {
        Self { events: None }
    }

    pub fn with_events() -> (Self, mpsc::UnboundedReceiver<IncomingRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { events: Some(tx) }, rx)
    }
}

impl Dispatcher for TestDispatcher {
    fn dispatch(&self, request: IncomingRequest) -> BoxFuture<'_, Result<Bytes, RpcError>> {
        Box::pin(async move {
            match request.method.as_str() {
                "echo" => Ok(request.payload),
                "sleep" => {
                    let text = String::from_utf8_lossy(&request.payload).into_owned();
                    let millis = text
                        .rsplit(':')
                        .next()
                        .and_then(|ms| ms.parse::<u64>().ok())
                        .unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(request.payload)
                }
                "fail" => Err(RpcError::new(RpcError::INVALID_ARGUMENT, "bad argument")),
                "layer" => Ok(Bytes::copy_from_slice(
                    request.layer_data.get("user").unwrap_or_default(),
                )),
                other => Err(RpcError::new(
                    RpcError::UNIMPLEMENTED,
                    format!("unknown method {other}"),
                )),
            }
        })
    }

    fn notify(&self, event: IncomingRequest) -> BoxFuture<'_, ()> {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
        Box::pin(std::future::ready(()))
    }
}

/// Start a listener on an ephemeral loopback port.
pub async fn start_listener(transport: &Transport) -> (Listener, SocketAddr) {
    let listener = transport.make_listener("127.0.0.1:0").unwrap();
    let addr = listener.start().await.unwrap();
    (listener, addr)
}

/// Plain transport with the test dispatcher.
pub fn plain_transport() -> Transport {
    TransportBuilder::default()
        .dispatcher(TestDispatcher::new())
        .build()
}

/// Self-signed certificate for `localhost`.
pub fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    (certified.cert.der().clone(), key.into())
}

/// Root store trusting exactly `cert`.
pub fn roots_for(cert: &CertificateDer<'static>) -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).unwrap();
    roots
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
