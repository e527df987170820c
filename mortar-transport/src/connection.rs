//! Multiplexed connection state machine.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::FramedRead;

use mortar_codec::{Frame, FrameCodec};
use mortar_core::{
    CodecError, Context, ControlMessage, Dispatcher, Headers, IncomingRequest, LayerData,
    MessageKind, MortarError, PROTOCOL_VERSION, RpcError, TransportError,
};
use mortar_layers::LayerStack;

use crate::metrics;
use crate::mux::{Multiplexer, Reply, Side};
use crate::stream::{NetStream, SecureStream, is_certificate_required_alert};
use crate::transport::TransportConfig;

/// How long `stop` waits to announce the close to the peer.
const CLOSE_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

type FrameReader = FramedRead<ReadHalf<NetStream>, FrameCodec>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed, not yet started.
    Created,
    /// Client handshake in progress.
    Connecting,
    /// Exchanging messages.
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// Torn down; every waiter has been failed.
    Disconnected,
}

impl ConnectionState {
    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection identifier, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Removes a request's waiter when its caller finishes or goes away.
struct Waiter<'a> {
    mux: &'a Multiplexer,
    id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.mux.remove(self.id);
    }
}

/// What the receive loop does after handling a frame.
enum Next {
    Continue,
    Disconnect(&'static str),
}

struct Inner {
    id: ConnectionId,
    side: Side,
    stream: SecureStream,
    mux: Multiplexer,
    layers: Option<Arc<LayerStack>>,
    dispatcher: Arc<dyn Dispatcher>,
    codec: FrameCodec,
    handshake_timeout: Duration,
    state: watch::Sender<ConnectionState>,
}

/// A multiplexed connection over one [`SecureStream`].
///
/// Any number of tasks may send concurrently; responses are matched to
/// requests by conversation id and may arrive in any order. A single
/// receive task reads frames, runs them through the layer stack, and hands
/// requests and events to the dispatcher on their own tasks.
///
/// Cloning is cheap and yields a handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("side", &self.inner.side)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        side: Side,
        stream: SecureStream,
        layers: Option<Arc<LayerStack>>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &TransportConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Created);
        Self {
            inner: Arc::new(Inner {
                id,
                side,
                stream,
                mux: Multiplexer::new(side),
                layers,
                dispatcher,
                codec: FrameCodec::with_max_frame_size(config.max_frame_size),
                handshake_timeout: config.handshake_timeout,
                state,
            }),
        }
    }

    /// Run the client handshake and start the receive loop.
    ///
    /// Sends `Config` and waits for the server's `Config` within the
    /// handshake timeout. On failure the connection is torn down.
    pub(crate) async fn start_client(&self) -> Result<(), TransportError> {
        self.inner.state.send_replace(ConnectionState::Connecting);

        match self.client_handshake().await {
            Ok(frames) => {
                self.mark_connected();
                self.spawn_receive_loop(frames);
                Ok(())
            }
            Err(err) => {
                metrics::handshake_failed(self.inner.side);
                tracing::warn!(
                    connection_id = %self.inner.id,
                    remote = %self.remote_addr(),
                    error = %err,
                    "connection handshake failed"
                );
                self.shutdown("handshake failed").await;
                Err(err)
            }
        }
    }

    async fn client_handshake(&self) -> Result<FrameReader, TransportError> {
        let mut frames = FramedRead::new(self.inner.stream.take_reader()?, self.inner.codec.clone());

        let exchange = async {
            self.write_control(&ControlMessage::config())
                .await
                .map_err(|e| self.refused_without_certificate(into_transport_error(e)))?;

            match frames.next().await {
                Some(Ok(frame)) => {
                    metrics::frame_received(frame.kind);
                    expect_config(&frame)
                }
                Some(Err(CodecError::Io(e))) if is_certificate_required_alert(&e) => {
                    Err(TransportError::MutualAuthenticationRequired)
                }
                Some(Err(CodecError::Io(e))) => {
                    Err(self.refused_without_certificate(TransportError::Io(e)))
                }
                Some(Err(e)) => Err(TransportError::Protocol(e.to_string())),
                None => Err(self.refused_without_certificate(TransportError::ConnectionClosed)),
            }
        };

        let outcome = tokio::time::timeout(self.inner.handshake_timeout, exchange).await;
        match outcome {
            Ok(Ok(())) => Ok(frames),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "no handshake reply within {:?}",
                self.inner.handshake_timeout
            ))),
        }
    }

    /// A server that wanted our missing certificate hangs up after the TLS
    /// handshake. Only an abrupt hangup is read that way; a `Close` or
    /// protocol error the server sent is reported as is.
    fn refused_without_certificate(&self, err: TransportError) -> TransportError {
        if !self.inner.stream.client_certificate_missing() {
            return err;
        }
        let hung_up = match &err {
            TransportError::ConnectionClosed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        };
        if hung_up {
            TransportError::MutualAuthenticationRequired
        } else {
            err
        }
    }

    /// Start the receive loop of an accepted connection.
    pub(crate) fn start_server(&self) -> Result<(), TransportError> {
        let frames = FramedRead::new(self.inner.stream.take_reader()?, self.inner.codec.clone());
        self.mark_connected();
        self.spawn_receive_loop(frames);
        Ok(())
    }

    fn mark_connected(&self) {
        self.inner.state.send_replace(ConnectionState::Connected);
        metrics::connection_opened(self.inner.side);
        tracing::info!(
            connection_id = %self.inner.id,
            side = self.inner.side.as_str(),
            local = %self.local_addr(),
            remote = %self.remote_addr(),
            tls = self.inner.stream.is_tls(),
            "connection established"
        );
    }

    fn spawn_receive_loop(&self, frames: FrameReader) {
        let conn = self.clone();
        tokio::spawn(async move { conn.receive_loop(frames).await });
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a request and wait for its response.
    ///
    /// The call ends with the response payload, the peer's error response
    /// (`Service`), a layer rejection (`Layer`), `Timeout` when the context
    /// deadline passes, `Cancelled` when its token fires, or
    /// `ConnectionClosed` if the connection goes down first. Timeout and
    /// cancellation leave the connection and other calls untouched; a late
    /// response is dropped.
    pub async fn send_request(
        &self,
        ctx: &Context,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes, MortarError> {
        self.ensure_connected()?;
        let started = Instant::now();
        if ctx.is_cancelled() {
            return Err(MortarError::Cancelled);
        }
        if ctx.is_expired() {
            return Err(MortarError::Timeout(Duration::ZERO));
        }

        let (id, reply) = self.inner.mux.register()?;
        let _waiter = Waiter {
            mux: &self.inner.mux,
            id,
        };

        let frame = self.message_frame(
            id,
            MessageKind::Request,
            ctx.layer_data.clone(),
            Some(method),
            payload,
        )?;

        tracing::debug!(connection_id = %self.inner.id, conversation_id = id, method, "sending request");
        self.write_frame(&frame).await?;

        self.await_reply(ctx, id, reply, started).await
    }

    async fn await_reply(
        &self,
        ctx: &Context,
        id: u64,
        reply: oneshot::Receiver<Reply>,
        started: Instant,
    ) -> Result<Bytes, MortarError> {
        let deadline = async {
            match ctx.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                }
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &ctx.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            reply = reply => {
                reply.unwrap_or(Err(MortarError::Transport(TransportError::ConnectionClosed)))
            }
            () = deadline => {
                let waited = ctx
                    .deadline
                    .map_or(started.elapsed(), |d| d.saturating_duration_since(started));
                tracing::debug!(connection_id = %self.inner.id, conversation_id = id, "request timed out");
                Err(MortarError::Timeout(waited))
            }
            () = cancelled => {
                tracing::debug!(connection_id = %self.inner.id, conversation_id = id, "request cancelled");
                Err(MortarError::Cancelled)
            }
        }
    }

    /// Send a one-way event.
    ///
    /// Returns once the frame is written; no response is expected.
    pub async fn send_event(
        &self,
        ctx: &Context,
        method: &str,
        payload: Bytes,
    ) -> Result<(), MortarError> {
        self.ensure_connected()?;
        if ctx.is_cancelled() {
            return Err(MortarError::Cancelled);
        }

        let id = self.inner.mux.allocate();
        let frame = self.message_frame(
            id,
            MessageKind::Event,
            ctx.layer_data.clone(),
            Some(method),
            payload,
        )?;

        tracing::debug!(connection_id = %self.inner.id, conversation_id = id, method, "sending event");
        self.write_frame(&frame).await
    }

    fn ensure_connected(&self) -> Result<(), MortarError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Created | ConnectionState::Connecting => Err(
                MortarError::Transport(TransportError::Protocol("connection not started".into())),
            ),
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                Err(MortarError::Transport(TransportError::ConnectionClosed))
            }
        }
    }

    /// Run the send side of the layer stack.
    ///
    /// With a stack present the layer data framelet is always sent, even
    /// when empty. Without one it is sent only if the caller supplied data.
    fn outgoing_layer_data(
        &self,
        kind: MessageKind,
        mut layer_data: LayerData,
    ) -> Result<Option<Bytes>, MortarError> {
        match &self.inner.layers {
            Some(stack) => {
                stack.on_send(kind, &mut layer_data)?;
                Ok(Some(layer_data.to_bytes()?))
            }
            None if layer_data.is_empty() => Ok(None),
            None => Ok(Some(layer_data.to_bytes()?)),
        }
    }

    fn message_frame(
        &self,
        id: u64,
        kind: MessageKind,
        layer_data: LayerData,
        method: Option<&str>,
        payload: Bytes,
    ) -> Result<Frame, MortarError> {
        let layer_data = self.outgoing_layer_data(kind, layer_data)?;
        let headers = method.map(|m| Headers::new(m).to_bytes()).transpose()?;
        Ok(Frame::message(id, kind, layer_data, headers, payload))
    }

    /// Answer a request, replacing the response with an error response if
    /// the layer stack rejects it.
    async fn send_reply(&self, id: u64, result: Result<Bytes, RpcError>) {
        let frame = match self.reply_frame(id, result) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(
                    connection_id = %self.inner.id,
                    conversation_id = id,
                    error = %err,
                    "response rejected, sending error response"
                );
                let rpc = match err {
                    MortarError::Layer { code, message } => RpcError::new(code, message),
                    other => RpcError::new(RpcError::INTERNAL, other.to_string()),
                };
                match rpc.to_bytes() {
                    Ok(payload) => Frame::message(id, MessageKind::Error, None, None, payload),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode error response");
                        return;
                    }
                }
            }
        };

        if let Err(err) = self.write_frame(&frame).await {
            tracing::debug!(
                connection_id = %self.inner.id,
                conversation_id = id,
                error = %err,
                "failed to send response"
            );
        }
    }

    fn reply_frame(&self, id: u64, result: Result<Bytes, RpcError>) -> Result<Frame, MortarError> {
        let (kind, payload) = match result {
            Ok(payload) => (MessageKind::Response, payload),
            Err(rpc) => (MessageKind::Error, rpc.to_bytes()?),
        };
        self.message_frame(id, kind, LayerData::new(), None, payload)
    }

    async fn write_control(&self, message: &ControlMessage) -> Result<(), MortarError> {
        self.write_frame(&Frame::control(message.to_bytes()?)).await
    }

    /// Encode and write one frame under the write permit.
    ///
    /// The write runs on its own task, so a frame is always written whole
    /// even if the caller is dropped halfway. A failed write tears the
    /// connection down.
    async fn write_frame(&self, frame: &Frame) -> Result<(), MortarError> {
        let mut buf = BytesMut::with_capacity(4 + frame.body_len());
        self.inner.codec.encode_frame(frame, &mut buf)?;

        let conn = self.clone();
        let kind = frame.kind;
        tokio::spawn(async move { conn.write_encoded(buf.freeze(), kind).await })
            .await
            .unwrap_or(Err(MortarError::Transport(TransportError::ConnectionClosed)))
    }

    async fn write_encoded(&self, buf: Bytes, kind: MessageKind) -> Result<(), MortarError> {
        let Ok(mut permit) = self.inner.stream.write_lock().await else {
            return Err(MortarError::Transport(TransportError::ConnectionClosed));
        };

        let written = async {
            permit.write_all(&buf).await?;
            permit.flush().await
        }
        .await;
        drop(permit);

        match written {
            Ok(()) => {
                metrics::frame_sent(kind);
                Ok(())
            }
            Err(e) => {
                let err = if self.inner.stream.is_shut_down() {
                    TransportError::ConnectionClosed
                } else {
                    TransportError::from(e)
                };
                tracing::debug!(connection_id = %self.inner.id, error = %err, "write failed");
                self.shutdown("write failed").await;
                Err(MortarError::Transport(err))
            }
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    async fn receive_loop(self, mut frames: FrameReader) {
        let reason = loop {
            let frame = match frames.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(CodecError::Io(e))) => {
                    if !self.inner.stream.is_shut_down() {
                        tracing::debug!(connection_id = %self.inner.id, error = %e, "read failed");
                    }
                    break "read failed";
                }
                Some(Err(e)) => {
                    self.protocol_violation(ControlMessage::MALFORMED_FRAME, &e.to_string())
                        .await;
                    break "malformed frame";
                }
                None => break "closed by peer",
            };

            metrics::frame_received(frame.kind);
            match self.handle_frame(frame).await {
                Next::Continue => {}
                Next::Disconnect(reason) => break reason,
            }
        };

        self.shutdown(reason).await;
    }

    async fn handle_frame(&self, frame: Frame) -> Next {
        match frame.kind {
            MessageKind::Control => self.handle_control(&frame).await,
            MessageKind::Request | MessageKind::Event => self.handle_inbound(frame).await,
            MessageKind::Response | MessageKind::Error => self.handle_reply(&frame).await,
        }
    }

    async fn handle_control(&self, frame: &Frame) -> Next {
        let message = match frame
            .control_content()
            .ok_or_else(|| CodecError::InvalidFrame("control frame without content".into()))
            .and_then(|content| ControlMessage::from_bytes(content))
        {
            Ok(message) => message,
            Err(e) => {
                self.protocol_violation(ControlMessage::MALFORMED_FRAME, &e.to_string())
                    .await;
                return Next::Disconnect("malformed control message");
            }
        };

        match message {
            ControlMessage::Config { version } if self.inner.side == Side::Server => {
                if version != PROTOCOL_VERSION {
                    self.protocol_violation(
                        ControlMessage::VERSION_MISMATCH,
                        &format!("expected protocol version {PROTOCOL_VERSION}, got {version}"),
                    )
                    .await;
                    return Next::Disconnect("protocol version mismatch");
                }
                if let Err(err) = self.write_control(&ControlMessage::config()).await {
                    tracing::debug!(connection_id = %self.inner.id, error = %err, "failed to answer config");
                    return Next::Disconnect("config reply failed");
                }
                Next::Continue
            }
            ControlMessage::Config { .. } => {
                tracing::debug!(connection_id = %self.inner.id, "ignoring repeated config");
                Next::Continue
            }
            ControlMessage::ProtocolError { code, details } => {
                tracing::error!(
                    connection_id = %self.inner.id,
                    code,
                    details = %details,
                    "peer reported protocol error"
                );
                Next::Disconnect("peer protocol error")
            }
            ControlMessage::Close => Next::Disconnect("closed by peer"),
        }
    }

    /// Requests and events: layers, then the dispatcher on its own task.
    async fn handle_inbound(&self, frame: Frame) -> Next {
        let id = frame.conversation_id;
        let kind = frame.kind;

        let parsed = incoming_layer_data(&frame).and_then(|layer_data| {
            let headers = frame
                .headers()
                .ok_or_else(|| CodecError::InvalidFrame(format!("{kind} frame without headers")))
                .and_then(|h| Headers::from_bytes(h))?;
            Ok((layer_data, headers))
        });
        let (layer_data, headers) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.protocol_violation(ControlMessage::MALFORMED_FRAME, &e.to_string())
                    .await;
                return Next::Disconnect("malformed frame");
            }
        };

        if let Some(stack) = &self.inner.layers {
            if let Err(err) = stack.on_receive(kind, &layer_data) {
                tracing::warn!(
                    connection_id = %self.inner.id,
                    conversation_id = id,
                    method = %headers.method,
                    error = %err,
                    "inbound {kind} rejected by layer"
                );
                if kind == MessageKind::Request {
                    self.send_reply(id, Err(err.to_rpc_error())).await;
                }
                return Next::Continue;
            }
        }

        let request = IncomingRequest {
            method: headers.method,
            payload: frame.payload().cloned().unwrap_or_default(),
            layer_data,
            remote_addr: self.remote_addr(),
        };

        let conn = self.clone();
        if kind == MessageKind::Request {
            tokio::spawn(async move {
                let result = conn.inner.dispatcher.dispatch(request).await;
                conn.send_reply(id, result).await;
            });
        } else {
            tokio::spawn(async move { conn.inner.dispatcher.notify(request).await });
        }

        Next::Continue
    }

    /// Responses and error responses: layers, then the waiting caller.
    ///
    /// A reply that does not decode is a protocol violation and closes the
    /// connection, which fails its waiter with `ConnectionClosed`.
    async fn handle_reply(&self, frame: &Frame) -> Next {
        let id = frame.conversation_id;

        let decoded = incoming_layer_data(frame).and_then(|layer_data| {
            let payload = frame.payload().cloned().unwrap_or_default();
            let body = if frame.kind == MessageKind::Response {
                Ok(payload)
            } else {
                Err(RpcError::from_bytes(&payload)?)
            };
            Ok((layer_data, body))
        });
        let (layer_data, body) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.protocol_violation(ControlMessage::MALFORMED_FRAME, &e.to_string())
                    .await;
                return Next::Disconnect("malformed reply");
            }
        };

        let reply = match &self.inner.layers {
            Some(stack) => stack
                .on_receive(frame.kind, &layer_data)
                .map_err(MortarError::from),
            None => Ok(()),
        }
        .and_then(|()| body.map_err(|rpc| MortarError::service(rpc.code, rpc.message)));

        self.inner.mux.complete(id, reply);
        Next::Continue
    }

    /// Tell the peer why we are closing. Best effort.
    async fn protocol_violation(&self, code: u32, details: &str) {
        metrics::protocol_error();
        tracing::error!(
            connection_id = %self.inner.id,
            remote = %self.remote_addr(),
            code,
            details,
            "protocol error, closing connection"
        );
        let message = ControlMessage::protocol_error(code, details);
        let _ = tokio::time::timeout(CLOSE_NOTICE_TIMEOUT, self.write_control(&message)).await;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Tear the connection down once.
    ///
    /// Moves to `Disconnecting`, shuts the stream, fails every pending
    /// request with `ConnectionClosed`, then moves to `Disconnected`.
    async fn shutdown(&self, reason: &str) {
        let mut was_connected = false;
        let first = self.inner.state.send_if_modified(|state| match *state {
            ConnectionState::Disconnecting | ConnectionState::Disconnected => false,
            current => {
                was_connected = current == ConnectionState::Connected;
                *state = ConnectionState::Disconnecting;
                true
            }
        });
        if !first {
            return;
        }

        tracing::info!(
            connection_id = %self.inner.id,
            remote = %self.remote_addr(),
            reason,
            "connection closing"
        );

        self.inner.stream.shutdown().await;
        self.inner
            .mux
            .close(&MortarError::Transport(TransportError::ConnectionClosed));

        self.inner.state.send_replace(ConnectionState::Disconnected);
        if was_connected {
            metrics::connection_closed(self.inner.side);
        }
    }

    /// Close the connection.
    ///
    /// Announces the close to the peer when connected, tears the connection
    /// down, and waits until it is `Disconnected`. Idempotent.
    pub async fn stop(&self) {
        if self.state() == ConnectionState::Connected {
            let _ =
                tokio::time::timeout(CLOSE_NOTICE_TIMEOUT, self.write_control(&ControlMessage::Close))
                    .await;
        }
        self.shutdown("stopped locally").await;
        self.closed().await;
    }

    /// Wait until the connection is `Disconnected`.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Which end of the connection this is.
    #[must_use]
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Local socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.stream.local_addr()
    }

    /// Remote socket address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.stream.remote_addr()
    }

    /// Whether the stream is TLS-wrapped.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.inner.stream.is_tls()
    }

    /// Whether a client certificate was part of the TLS handshake.
    #[must_use]
    pub fn is_mutually_authenticated(&self) -> bool {
        self.inner.stream.is_mutually_authenticated()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.mux.pending_count()
    }
}

fn incoming_layer_data(frame: &Frame) -> Result<LayerData, CodecError> {
    match frame.layer_data() {
        Some(bytes) => LayerData::from_bytes(bytes),
        None => Ok(LayerData::new()),
    }
}

fn expect_config(frame: &Frame) -> Result<(), TransportError> {
    let content = match (frame.kind, frame.control_content()) {
        (MessageKind::Control, Some(content)) => content,
        _ => {
            return Err(TransportError::Protocol(format!(
                "expected config, got {} frame",
                frame.kind
            )));
        }
    };

    match ControlMessage::from_bytes(content).map_err(|e| TransportError::Protocol(e.to_string()))? {
        ControlMessage::Config { version } if version == PROTOCOL_VERSION => Ok(()),
        ControlMessage::Config { version } => Err(TransportError::Protocol(format!(
            "peer speaks protocol version {version}, expected {PROTOCOL_VERSION}"
        ))),
        ControlMessage::ProtocolError { details, .. } => Err(TransportError::Protocol(details)),
        ControlMessage::Close => Err(TransportError::ConnectionClosed),
    }
}

fn into_transport_error(err: MortarError) -> TransportError {
    match err {
        MortarError::Transport(err) => err,
        other => TransportError::Protocol(other.to_string()),
    }
}
