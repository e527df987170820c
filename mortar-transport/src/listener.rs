//! Accepting side of the transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mortar_core::TransportError;

use crate::connection::{Connection, ConnectionId};
use crate::metrics;
use crate::mux::Side;
use crate::stream::SecureStream;
use crate::transport::Shared;

/// Pause after a failed `accept` so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct ListenerInner {
    requested_addr: SocketAddr,
    bound_addr: OnceLock<SocketAddr>,
    shared: Arc<Shared>,
    connections: DashMap<ConnectionId, Connection>,
    shutdown: CancellationToken,
    started: AtomicBool,
    accepted: AtomicU64,
    refused: AtomicU64,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Accepts inbound sockets and owns the connections made from them.
///
/// Each accepted socket is negotiated on its own task, so a slow or
/// hostile peer never holds up the accept loop. A socket that fails TLS
/// or is refused a layer stack is closed and logged; the listener keeps
/// accepting. Connections leave the live set when they disconnect.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .field("stopped", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl Listener {
    pub(crate) fn new(addr: SocketAddr, shared: Arc<Shared>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                requested_addr: addr,
                bound_addr: OnceLock::new(),
                shared,
                connections: DashMap::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                accepted: AtomicU64::new(0),
                refused: AtomicU64::new(0),
                accept_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Bind and start accepting.
    ///
    /// Returns the bound address, which differs from the requested one when
    /// port 0 was asked for.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the address cannot be bound, `Protocol` if the
    /// listener was already started, and `ConnectionClosed` if it was
    /// stopped.
    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Protocol("listener already started".into()));
        }

        let tcp = TcpListener::bind(self.inner.requested_addr).await?;
        let local_addr = tcp.local_addr()?;
        let _ = self.inner.bound_addr.set(local_addr);

        tracing::info!(
            %local_addr,
            tls = self.inner.shared.server_tls.is_some(),
            "listener started"
        );

        let listener = self.clone();
        let task = tokio::spawn(async move { listener.accept_loop(tcp).await });
        *self.inner.accept_task.lock() = Some(task);

        Ok(local_addr)
    }

    async fn accept_loop(self, tcp: TcpListener) {
        loop {
            tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => break,
                accepted = tcp.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let listener = self.clone();
                        tokio::spawn(async move { listener.accept_connection(socket, peer).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        tracing::debug!(local_addr = %self.local_addr(), "accept loop stopped");
    }

    async fn accept_connection(self, socket: TcpStream, peer: SocketAddr) {
        let shared = &self.inner.shared;
        shared.prepare_socket(&socket);

        let id = ConnectionId::next();
        let layers = match shared.layer_stack(id) {
            Ok(layers) => layers,
            Err(e) => {
                self.refuse();
                tracing::warn!(connection_id = %id, remote = %peer, error = %e, "connection refused");
                return;
            }
        };

        let stream = match SecureStream::server(socket, shared.server_tls.as_ref()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.refuse();
                tracing::warn!(connection_id = %id, remote = %peer, error = %e, "tls handshake failed");
                return;
            }
        };

        if self.inner.shutdown.is_cancelled() {
            stream.shutdown().await;
            return;
        }

        let conn = Connection::new(
            id,
            Side::Server,
            stream,
            layers,
            Arc::clone(&shared.dispatcher),
            &shared.config,
        );
        self.inner.connections.insert(id, conn.clone());
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = conn.start_server() {
            self.inner.connections.remove(&id);
            tracing::warn!(connection_id = %id, remote = %peer, error = %e, "failed to start connection");
            conn.stop().await;
            return;
        }

        // stop() may have drained the set before the insert above
        if self.inner.shutdown.is_cancelled() {
            conn.stop().await;
        }

        conn.closed().await;
        self.inner.connections.remove(&id);
    }

    fn refuse(&self) {
        self.inner.refused.fetch_add(1, Ordering::Relaxed);
        metrics::handshake_failed(Side::Server);
    }

    /// Stop accepting and stop every live connection.
    ///
    /// Idempotent; returns once the listening socket is closed and every
    /// connection is `Disconnected`.
    pub async fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(local_addr = %self.local_addr(), "listener stopping");
        }
        self.inner.shutdown.cancel();

        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let connections: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::future::join_all(connections.iter().map(Connection::stop)).await;
    }

    /// Bound address once started, the requested address before.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner
            .bound_addr
            .get()
            .copied()
            .unwrap_or(self.inner.requested_addr)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Connections created since the listener started, live or not.
    #[must_use]
    pub fn accepted_count(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    /// Sockets closed before a connection was created for them, because
    /// the TLS handshake failed or the layer stack provider refused.
    #[must_use]
    pub fn refused_count(&self) -> u64 {
        self.inner.refused.load(Ordering::Relaxed)
    }

    /// Snapshot of the live connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use crate::transport::Transport;

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let transport = Transport::builder().build();
        let listener = transport.make_listener("127.0.0.1:0").unwrap();
        assert_eq!(listener.local_addr().port(), 0);

        let addr = listener.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr(), addr);
        assert_eq!(listener.connection_count(), 0);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice() {
        let transport = Transport::builder().build();
        let listener = transport.make_listener("127.0.0.1:0").unwrap();
        listener.start().await.unwrap();
        assert!(listener.start().await.is_err());
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = Transport::builder().build();
        let listener = transport.make_listener("127.0.0.1:0").unwrap();
        let addr = listener.start().await.unwrap();

        listener.stop().await;
        listener.stop().await;
        assert!(listener.is_stopped());
        assert!(listener.start().await.is_err());

        // Socket is released once stop returns
        let rebound = tokio::net::TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_connections_tracked() {
        let transport = Transport::builder().build();
        let listener = transport.make_listener("127.0.0.1:0").unwrap();
        let addr = listener.start().await.unwrap();

        let conn = transport.connect(&format!("mortar://{addr}")).await.unwrap();

        // Server registers before answering the handshake
        assert_eq!(listener.connection_count(), 1);
        assert_eq!(listener.accepted_count(), 1);
        assert_eq!(listener.refused_count(), 0);

        conn.stop().await;
        for _ in 0..100 {
            if listener.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(listener.connection_count(), 0);

        transport.stop().await;
    }
}
