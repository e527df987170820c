//! Secure stream wrapper around one connected socket.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, Socket};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use mortar_core::TransportError;

use crate::tls::{TlsClientConfig, TlsServerConfig, server_name};

/// Upper bound on the graceful TLS close during shutdown.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A plain or TLS byte stream.
///
/// Connections read and write through this type without knowing which
/// variant they hold.
pub enum NetStream {
    /// Unencrypted TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(tcp) => tcp,
            Self::Tls(tls) => tls.get_ref().0,
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Exclusive right to write to a [`SecureStream`].
///
/// Frames written while holding one permit are never interleaved with
/// frames from another writer.
pub type WritePermit<'a> = tokio::sync::MutexGuard<'a, WriteHalf<NetStream>>;

/// One connected socket, optionally TLS-authenticated.
///
/// Owns the socket and the stream layered on it. The read half is handed
/// to a single reader; writers take turns through [`write_lock`]. Local
/// and remote addresses are captured up front so they stay readable after
/// shutdown.
///
/// [`write_lock`]: SecureStream::write_lock
pub struct SecureStream {
    reader: parking_lot::Mutex<Option<ReadHalf<NetStream>>>,
    writer: tokio::sync::Mutex<WriteHalf<NetStream>>,
    socket: Socket,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    is_tls: bool,
    mutually_authenticated: bool,
    client_certificate_missing: bool,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("is_tls", &self.is_tls)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Whether a TLS error says the server rejected us for lacking a client
/// certificate.
pub(crate) fn is_certificate_required_alert(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| {
            matches!(
                e,
                rustls::Error::AlertReceived(rustls::AlertDescription::CertificateRequired)
            )
        })
}

fn is_no_certificate_presented(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| matches!(e, rustls::Error::NoCertificatesPresented))
}

impl SecureStream {
    /// Wrap a connected client socket, running the TLS handshake against
    /// `target_host` when a TLS config is given.
    ///
    /// # Errors
    ///
    /// Returns `TlsAuthentication` if the handshake fails or times out, and
    /// `MutualAuthenticationRequired` if the server rejected the handshake
    /// because no client certificate was sent.
    pub async fn client(
        target_host: &str,
        tcp: TcpStream,
        tls: Option<&TlsClientConfig>,
    ) -> Result<Self, TransportError> {
        let Some(tls) = tls else {
            return Self::new(NetStream::Plain(tcp), false, false);
        };

        let name = server_name(target_host)?;
        let (config, requested) = tls.for_connection();
        let connector = TlsConnector::from(config);

        let stream =
            match tokio::time::timeout(tls.handshake_timeout, connector.connect(name, tcp)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) if is_certificate_required_alert(&e) => {
                    return Err(TransportError::MutualAuthenticationRequired);
                }
                Ok(Err(e)) => {
                    return Err(TransportError::TlsAuthentication(format!(
                        "handshake with {target_host} failed: {e}"
                    )));
                }
                Err(_) => {
                    return Err(TransportError::TlsAuthentication(format!(
                        "handshake with {target_host} timed out"
                    )));
                }
            };

        let client_certificate_missing = requested.is_some_and(|r| r.load(Ordering::Acquire));
        tracing::debug!(
            target_host,
            client_certificate_missing,
            "client tls handshake complete"
        );

        Self::new(
            NetStream::Tls(Box::new(TlsStream::Client(stream))),
            tls.has_client_cert(),
            client_certificate_missing,
        )
    }

    /// Wrap an accepted server socket, running the TLS handshake when a
    /// TLS config is given.
    ///
    /// # Errors
    ///
    /// Returns `MutualAuthenticationRequired` if the config requires a client
    /// certificate and none was presented (the socket is shut down), and
    /// `TlsAuthentication` for any other handshake failure.
    pub async fn server(
        tcp: TcpStream,
        tls: Option<&TlsServerConfig>,
    ) -> Result<Self, TransportError> {
        let Some(tls) = tls else {
            return Self::new(NetStream::Plain(tcp), false, false);
        };

        let acceptor = TlsAcceptor::from(tls.rustls_config());
        let stream = match tokio::time::timeout(tls.handshake_timeout, acceptor.accept(tcp)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if is_no_certificate_presented(&e) => {
                return Err(TransportError::MutualAuthenticationRequired);
            }
            Ok(Err(e)) => {
                return Err(TransportError::TlsAuthentication(format!(
                    "handshake failed: {e}"
                )));
            }
            Err(_) => {
                return Err(TransportError::TlsAuthentication(
                    "handshake timed out".to_string(),
                ));
            }
        };

        let has_client_cert = stream
            .get_ref()
            .1
            .peer_certificates()
            .is_some_and(|certs| !certs.is_empty());

        let secure = Self::new(
            NetStream::Tls(Box::new(TlsStream::Server(stream))),
            has_client_cert,
            false,
        )?;

        if tls.client_certificate_required() && !has_client_cert {
            tracing::debug!(remote = %secure.remote_addr, "client presented no certificate");
            secure.shutdown().await;
            return Err(TransportError::MutualAuthenticationRequired);
        }

        Ok(secure)
    }

    fn new(
        stream: NetStream,
        mutually_authenticated: bool,
        client_certificate_missing: bool,
    ) -> Result<Self, TransportError> {
        let tcp = stream.tcp();
        let local_addr = tcp.local_addr()?;
        let remote_addr = tcp.peer_addr()?;
        let socket = SockRef::from(tcp).try_clone()?;
        let is_tls = matches!(stream, NetStream::Tls(_));

        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            socket,
            local_addr,
            remote_addr,
            is_tls,
            mutually_authenticated,
            client_certificate_missing,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Take the read half. Succeeds once.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterShutdown` after shutdown, or `Protocol` if the reader
    /// was already taken.
    pub fn take_reader(&self) -> Result<ReadHalf<NetStream>, TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::UseAfterShutdown);
        }
        self.reader
            .lock()
            .take()
            .ok_or_else(|| TransportError::Protocol("stream reader already taken".to_string()))
    }

    /// Wait for the write permit.
    ///
    /// # Errors
    ///
    /// Returns `UseAfterShutdown` if the stream is, or becomes, shut down.
    pub async fn write_lock(&self) -> Result<WritePermit<'_>, TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::UseAfterShutdown);
        }
        let permit = self.writer.lock().await;
        if self.is_shut_down() {
            return Err(TransportError::UseAfterShutdown);
        }
        Ok(permit)
    }

    /// Tear the stream down.
    ///
    /// Safe to call concurrently and repeatedly: only the first call does
    /// the work and returns `true`. If no writer holds the permit, a TLS
    /// stream first sends `close_notify`. The socket is then shut down in
    /// both directions. Errors are logged, never returned.
    pub async fn shutdown(&self) -> bool {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        drop(self.reader.lock().take());

        if let Ok(mut writer) = self.writer.try_lock() {
            match tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == io::ErrorKind::NotConnected => {}
                Ok(Err(e)) => {
                    tracing::debug!(remote = %self.remote_addr, error = %e, "graceful close failed");
                }
                Err(_) => {
                    tracing::debug!(remote = %self.remote_addr, "graceful close timed out");
                }
            }
        }

        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::error!(remote = %self.remote_addr, error = %e, "socket shutdown failed");
            }
        }

        tracing::debug!(remote = %self.remote_addr, "stream shut down");
        true
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Local socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote socket address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the stream is TLS-wrapped.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// Whether a client certificate was part of the handshake.
    ///
    /// On the server this means the client presented one; on the client,
    /// that one was configured.
    #[must_use]
    pub fn is_mutually_authenticated(&self) -> bool {
        self.mutually_authenticated
    }

    /// Client side only: the server asked for a certificate we did not have.
    #[must_use]
    pub fn client_certificate_missing(&self) -> bool {
        self.client_certificate_missing
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let (a, b) = pair().await;
        let client = SecureStream::client("127.0.0.1", a, None).await.unwrap();
        let server = SecureStream::server(b, None).await.unwrap();

        assert!(!client.is_tls());
        assert_eq!(client.local_addr(), server.remote_addr());

        {
            let mut permit = client.write_lock().await.unwrap();
            permit.write_all(b"hello").await.unwrap();
            permit.flush().await.unwrap();
        }

        let mut reader = server.take_reader().unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert!(server.take_reader().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let (a, _b) = pair().await;
        let stream = Arc::new(SecureStream::client("127.0.0.1", a, None).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let stream = Arc::clone(&stream);
            tasks.push(tokio::spawn(async move { stream.shutdown().await }));
        }

        let mut performed = 0;
        for task in tasks {
            if task.await.unwrap() {
                performed += 1;
            }
        }

        assert_eq!(performed, 1);
        assert!(stream.is_shut_down());
        assert!(!stream.shutdown().await);
    }

    #[tokio::test]
    async fn test_use_after_shutdown() {
        let (a, _b) = pair().await;
        let stream = SecureStream::client("127.0.0.1", a, None).await.unwrap();
        let remote = stream.remote_addr();

        assert!(stream.shutdown().await);

        assert!(matches!(
            stream.write_lock().await,
            Err(TransportError::UseAfterShutdown)
        ));
        assert!(matches!(
            stream.take_reader(),
            Err(TransportError::UseAfterShutdown)
        ));
        // Addresses stay readable
        assert_eq!(stream.remote_addr(), remote);
    }

    #[tokio::test]
    async fn test_peer_sees_eof_after_shutdown() {
        let (a, b) = pair().await;
        let client = SecureStream::client("127.0.0.1", a, None).await.unwrap();
        let server = SecureStream::server(b, None).await.unwrap();
        let mut reader = server.take_reader().unwrap();

        client.shutdown().await;

        let mut buf = Vec::new();
        let n = reader.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
