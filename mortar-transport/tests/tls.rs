mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mortar_codec::{Frame, FrameCodec};
use mortar_core::{Context, ControlMessage, MessageKind, TransportError};
use mortar_resolver::StaticResolver;
use mortar_transport::{
    CertificateCheck, Endpoint, TlsClientConfig, TlsServerConfig, Transport, TransportBuilder,
};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::FramedRead;

use common::{TestDispatcher, eventually, roots_for, self_signed, start_listener};

fn localhost() -> StaticResolver {
    StaticResolver::new().with_host("localhost", "127.0.0.1".parse().unwrap())
}

fn secure_endpoint(port: u16) -> Endpoint {
    format!("mortars://localhost:{port}").parse().unwrap()
}

#[tokio::test]
async fn test_tls_round_trip() {
    let (cert, key) = self_signed();
    let server = TransportBuilder::default()
        .server_tls(TlsServerConfig::builder(vec![cert.clone()], key).build().unwrap())
        .dispatcher(TestDispatcher::new())
        .build();
    let (listener, addr) = start_listener(&server).await;

    let client = Transport::builder()
        .resolver(localhost())
        .client_tls(
            TlsClientConfig::builder()
                .root_certs(roots_for(&cert))
                .build()
                .unwrap(),
        )
        .build();
    let conn = client.connect_to(&secure_endpoint(addr.port())).await.unwrap();
    assert!(conn.is_tls());
    assert!(!conn.is_mutually_authenticated());

    let reply = conn
        .send_request(&Context::new(), "echo", Bytes::from_static(b"sealed"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"sealed"));

    assert_eq!(listener.connection_count(), 1);
    conn.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_untrusted_server_certificate() {
    let (cert, key) = self_signed();
    let server = TransportBuilder::default()
        .server_tls(TlsServerConfig::builder(vec![cert], key).build().unwrap())
        .build();
    let (listener, addr) = start_listener(&server).await;

    // Trusts a different self-signed certificate
    let (other, _) = self_signed();
    let client = Transport::builder()
        .resolver(localhost())
        .client_tls(
            TlsClientConfig::builder()
                .root_certs(roots_for(&other))
                .build()
                .unwrap(),
        )
        .build();
    let err = client
        .connect_to(&secure_endpoint(addr.port()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::TlsAuthentication(_)));

    assert!(eventually(|| listener.refused_count() == 1).await);
    assert_eq!(listener.accepted_count(), 0);
    assert_eq!(listener.connection_count(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_validator_overrides_verdict() {
    let (cert, key) = self_signed();
    let server = TransportBuilder::default()
        .server_tls(TlsServerConfig::builder(vec![cert.clone()], key).build().unwrap())
        .dispatcher(TestDispatcher::new())
        .build();
    let (_listener, addr) = start_listener(&server).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let expected = cert.clone();
    let calls = Arc::clone(&seen);
    let client = Transport::builder()
        .resolver(localhost())
        .client_tls(
            TlsClientConfig::builder()
                .root_certs(rustls::RootCertStore::empty())
                .validator(move |check: &CertificateCheck<'_>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Pinned certificate, whatever WebPKI says
                    check.end_entity[..] == expected[..]
                })
                .build()
                .unwrap(),
        )
        .build();

    let conn = client.connect_to(&secure_endpoint(addr.port())).await.unwrap();
    assert!(seen.load(Ordering::SeqCst) >= 1);
    assert!(
        conn.send_request(&Context::new(), "echo", Bytes::new())
            .await
            .is_ok()
    );
    server.stop().await;
}

#[tokio::test]
async fn test_mutual_authentication_required() {
    let (server_cert, server_key) = self_signed();
    let (client_cert, _) = self_signed();

    let server = TransportBuilder::default()
        .server_tls(
            TlsServerConfig::builder(vec![server_cert.clone()], server_key)
                .require_client_certificate(true)
                .client_roots(roots_for(&client_cert))
                .build()
                .unwrap(),
        )
        .build();
    let (listener, addr) = start_listener(&server).await;

    let client = Transport::builder()
        .resolver(localhost())
        .client_tls(
            TlsClientConfig::builder()
                .root_certs(roots_for(&server_cert))
                .build()
                .unwrap(),
        )
        .build();
    let err = client
        .connect_to(&secure_endpoint(addr.port()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::MutualAuthenticationRequired));

    assert!(eventually(|| listener.refused_count() == 1).await);
    assert_eq!(listener.accepted_count(), 0);
    assert_eq!(listener.connection_count(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_close_without_certificate_is_not_mutual_auth_failure() {
    let (server_cert, server_key) = self_signed();
    let (client_cert, _) = self_signed();

    // Asks for a client certificate without requiring one, then answers
    // the handshake with an orderly close
    let acceptor = TlsAcceptor::from(
        TlsServerConfig::builder(vec![server_cert.clone()], server_key)
            .client_roots(roots_for(&client_cert))
            .build()
            .unwrap()
            .rustls_config(),
    );
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = peer.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (socket, _) = peer.accept().await.unwrap();
        let tls = acceptor.accept(socket).await.unwrap();
        let (read, mut write) = tokio::io::split(tls);
        let mut frames = FramedRead::new(read, FrameCodec::new());

        let hello = frames.next().await.unwrap().unwrap();
        assert_eq!(hello.kind, MessageKind::Control);

        let close = Frame::control(ControlMessage::Close.to_bytes().unwrap());
        let mut buf = BytesMut::new();
        FrameCodec::new().encode_frame(&close, &mut buf).unwrap();
        write.write_all(&buf).await.unwrap();
        let _ = write.shutdown().await;
    });

    let client = Transport::builder()
        .resolver(localhost())
        .client_tls(
            TlsClientConfig::builder()
                .root_certs(roots_for(&server_cert))
                .build()
                .unwrap(),
        )
        .build();
    let err = client.connect_to(&secure_endpoint(port)).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionClosed));

    server.await.unwrap();
}

#[tokio::test]
async fn test_mutual_authentication() {
    let (server_cert, server_key) = self_signed();
    let (client_cert, client_key) = self_signed();

    let server = TransportBuilder::default()
        .server_tls(
            TlsServerConfig::builder(vec![server_cert.clone()], server_key)
                .require_client_certificate(true)
                .client_roots(roots_for(&client_cert))
                .build()
                .unwrap(),
        )
        .dispatcher(TestDispatcher::new())
        .build();
    let (listener, addr) = start_listener(&server).await;

    let client = Transport::builder()
        .resolver(localhost())
        .client_tls(
            TlsClientConfig::builder()
                .root_certs(roots_for(&server_cert))
                .client_cert(vec![client_cert], client_key)
                .build()
                .unwrap(),
        )
        .build();
    let conn = client.connect_to(&secure_endpoint(addr.port())).await.unwrap();
    assert!(conn.is_mutually_authenticated());

    let accepted = listener.connections();
    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].is_mutually_authenticated());

    let reply = conn
        .send_request(&Context::new(), "echo", Bytes::from_static(b"both ways"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"both ways"));
    server.stop().await;
}

#[tokio::test]
async fn test_plain_client_against_tls_listener() {
    let (cert, key) = self_signed();
    let server = TransportBuilder::default()
        .server_tls(TlsServerConfig::builder(vec![cert], key).build().unwrap())
        .build();
    let (listener, addr) = start_listener(&server).await;

    let client = Transport::builder()
        .config(
            mortar_transport::TransportConfig::default()
                .handshake_timeout(std::time::Duration::from_millis(500)),
        )
        .build();
    assert!(client.connect(&format!("mortar://{addr}")).await.is_err());

    assert!(eventually(|| listener.refused_count() == 1).await);
    assert_eq!(listener.accepted_count(), 0);
    assert_eq!(listener.connection_count(), 0);
    server.stop().await;
}
