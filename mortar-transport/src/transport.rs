//! Transport factory: client connections and listeners.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpStream;

use mortar_codec::DEFAULT_MAX_FRAME_SIZE;
use mortar_core::{Dispatcher, NullDispatcher, TransportError};
use mortar_layers::{LayerStack, LayerStackProvider, StaticLayerStackProvider};
use mortar_resolver::{Resolver, SystemResolver};

use crate::connection::{Connection, ConnectionId};
use crate::endpoint::{Endpoint, parse_listen_addr};
use crate::keepalive::{TimeoutConfig, configure_keep_alive};
use crate::listener::Listener;
use crate::metrics;
use crate::mux::Side;
use crate::stream::SecureStream;
use crate::tls::{TlsClientConfig, TlsServerConfig};

/// Connection-level settings shared by every connection of a transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum frame size accepted or sent.
    pub max_frame_size: usize,

    /// Time allowed for the TCP connect.
    pub connect_timeout: Duration,

    /// Time allowed for the client's `Config` exchange.
    pub handshake_timeout: Duration,

    /// Disable Nagle's algorithm.
    pub nodelay: bool,

    /// Socket keep-alive.
    pub timeouts: TimeoutConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            nodelay: true,
            timeouts: TimeoutConfig::disabled(),
        }
    }
}

impl TransportConfig {
    /// Set the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the TCP connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the protocol handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set socket keep-alive.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// State shared between a transport and the listeners it made.
pub(crate) struct Shared {
    pub(crate) config: TransportConfig,
    pub(crate) server_tls: Option<TlsServerConfig>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    client_tls: Option<TlsClientConfig>,
    default_client_tls: OnceLock<Result<TlsClientConfig, TransportError>>,
    resolver: Arc<dyn Resolver>,
    layers: Option<Arc<dyn LayerStackProvider>>,
}

impl Shared {
    /// Resolve the layer stack for a new connection.
    pub(crate) fn layer_stack(
        &self,
        id: ConnectionId,
    ) -> Result<Option<Arc<LayerStack>>, TransportError> {
        let Some(provider) = &self.layers else {
            return Ok(None);
        };
        provider
            .layer_stack(&id.to_string())
            .map_err(|e| TransportError::LayerStack(format!("{id}: {e}")))
    }

    /// Apply socket options to a fresh TCP stream.
    pub(crate) fn prepare_socket(&self, tcp: &TcpStream) {
        if let Err(e) = tcp.set_nodelay(self.config.nodelay) {
            tracing::warn!(error = %e, "failed to set TCP_NODELAY");
        }
        configure_keep_alive(tcp, &self.config.timeouts);
    }

    fn client_tls(&self) -> Result<&TlsClientConfig, TransportError> {
        if let Some(tls) = &self.client_tls {
            return Ok(tls);
        }
        self.default_client_tls
            .get_or_init(|| TlsClientConfig::builder().build())
            .as_ref()
            .map_err(Clone::clone)
    }
}

/// Builder for [`Transport`].
#[derive(Default)]
pub struct TransportBuilder {
    config: TransportConfig,
    resolver: Option<Arc<dyn Resolver>>,
    client_tls: Option<TlsClientConfig>,
    server_tls: Option<TlsServerConfig>,
    layers: Option<Arc<dyn LayerStackProvider>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl TransportBuilder {
    /// Replace the connection settings.
    #[must_use]
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable socket keep-alive. Zero for either value leaves it off.
    #[must_use]
    pub fn keep_alive(mut self, time: Duration, interval: Duration) -> Self {
        self.config.timeouts = TimeoutConfig::new(time, interval);
        self
    }

    /// Resolver used for client endpoint hosts. Defaults to the system resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: impl Resolver) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// TLS settings for `mortars://` connections.
    ///
    /// Without one, secure connections verify against the Mozilla roots and
    /// present no client certificate.
    #[must_use]
    pub fn client_tls(mut self, tls: TlsClientConfig) -> Self {
        self.client_tls = Some(tls);
        self
    }

    /// TLS settings for listeners. Listeners are plain TCP without one.
    #[must_use]
    pub fn server_tls(mut self, tls: TlsServerConfig) -> Self {
        self.server_tls = Some(tls);
        self
    }

    /// Provider consulted once per connection for its layer stack.
    #[must_use]
    pub fn layer_stack_provider(mut self, provider: impl LayerStackProvider) -> Self {
        self.layers = Some(Arc::new(provider));
        self
    }

    /// Run the same layer stack on every connection.
    #[must_use]
    pub fn layer_stack(self, stack: LayerStack) -> Self {
        self.layer_stack_provider(StaticLayerStackProvider::new(stack))
    }

    /// Receiver of inbound requests and events, on both client and server
    /// connections. Defaults to answering `UNIMPLEMENTED`.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Build the transport.
    #[must_use]
    pub fn build(self) -> Transport {
        let shared = Shared {
            config: self.config,
            server_tls: self.server_tls,
            dispatcher: self.dispatcher.unwrap_or_else(|| Arc::new(NullDispatcher)),
            client_tls: self.client_tls,
            default_client_tls: OnceLock::new(),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(SystemResolver::new())),
            layers: self.layers,
        };
        Transport {
            shared: Arc::new(shared),
            listeners: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }
}

/// Creates client connections and listeners.
///
/// Cloning is cheap; clones share configuration and the set of listeners
/// that [`stop`](Self::stop) shuts down.
///
/// ## Example
///
/// ```rust,no_run
/// use bytes::Bytes;
/// use mortar_core::Context;
/// use mortar_transport::Transport;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Transport::builder().build();
///
/// let listener = transport.make_listener("127.0.0.1:0")?;
/// let addr = listener.start().await?;
///
/// let conn = transport.connect(&format!("mortar://{addr}")).await?;
/// let reply = conn
///     .send_request(&Context::new(), "greeter.hello", Bytes::from_static(b"hi"))
///     .await;
/// assert!(reply.is_err()); // no dispatcher installed
///
/// conn.stop().await;
/// transport.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    listeners: Arc<parking_lot::Mutex<Vec<Listener>>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.shared.config)
            .field("client_tls", &self.shared.client_tls.is_some())
            .field("server_tls", &self.shared.server_tls.is_some())
            .field("listeners", &self.listeners.lock().len())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Start building a transport.
    #[must_use]
    pub fn builder() -> TransportBuilder {
        TransportBuilder::default()
    }

    /// Connection settings in use.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Connect to a `mortar://` or `mortars://` address.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` if the address does not parse, and
    /// otherwise whatever [`connect_to`](Self::connect_to) returns.
    pub async fn connect(&self, address: &str) -> Result<Connection, TransportError> {
        let endpoint: Endpoint = address.parse()?;
        self.connect_to(&endpoint).await
    }

    /// Connect to an endpoint and run the handshake.
    ///
    /// # Errors
    ///
    /// * `Resolution` if the host does not resolve.
    /// * `LayerStack` if the layer stack provider refuses the connection.
    /// * `ConnectionFailed` if the TCP connect fails or times out.
    /// * `TlsAuthentication` or `MutualAuthenticationRequired` if TLS fails.
    /// * `Protocol` or `ConnectionClosed` if the handshake fails.
    pub async fn connect_to(&self, endpoint: &Endpoint) -> Result<Connection, TransportError> {
        let shared = &self.shared;

        let ip = shared
            .resolver
            .resolve(endpoint.host())
            .await
            .map_err(|e| TransportError::Resolution(format!("{}: {e}", endpoint.host())))?;
        let addr = SocketAddr::new(ip, endpoint.port());

        let id = ConnectionId::next();
        let layers = shared.layer_stack(id)?;

        tracing::debug!(connection_id = %id, %endpoint, %addr, "connecting");
        let tcp = match tokio::time::timeout(shared.config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!("{addr}: {e}")));
            }
            Err(_) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{addr}: timed out after {:?}",
                    shared.config.connect_timeout
                )));
            }
        };
        shared.prepare_socket(&tcp);

        let tls = if endpoint.use_tls() {
            Some(shared.client_tls()?)
        } else {
            None
        };
        let stream = SecureStream::client(endpoint.host(), tcp, tls)
            .await
            .inspect_err(|e| {
                metrics::handshake_failed(Side::Client);
                tracing::warn!(connection_id = %id, %endpoint, error = %e, "tls handshake failed");
            })?;

        let conn = Connection::new(
            id,
            Side::Client,
            stream,
            layers,
            Arc::clone(&shared.dispatcher),
            &shared.config,
        );
        conn.start_client().await?;
        Ok(conn)
    }

    /// Create a listener for `mortar[s]://ip[:port]`, `ip:port`, `[ip]:port`
    /// or a bare `ip`. The listener does not bind until started.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` if the address does not parse.
    pub fn make_listener(&self, address: &str) -> Result<Listener, TransportError> {
        let addr = parse_listen_addr(address)?;
        Ok(self.make_listener_at(addr))
    }

    /// Create a listener for a socket address.
    #[must_use]
    pub fn make_listener_at(&self, addr: SocketAddr) -> Listener {
        let listener = Listener::new(addr, Arc::clone(&self.shared));
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !l.is_stopped());
        listeners.push(listener.clone());
        listener
    }

    /// Stop every listener this transport created.
    pub async fn stop(&self) {
        let listeners: Vec<Listener> = std::mem::take(&mut *self.listeners.lock());
        futures::future::join_all(listeners.iter().map(Listener::stop)).await;
    }
}
