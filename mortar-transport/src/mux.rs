//! Request/response multiplexing for concurrent calls on one connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use mortar_core::{MortarError, TransportError};

/// Which end of a connection this is.
///
/// Determines conversation id parity so ids chosen by the two peers never
/// collide: clients use odd ids, servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Connection opened by [`Transport::connect`](crate::Transport::connect).
    Client,
    /// Connection accepted by a [`Listener`](crate::Listener).
    Server,
}

impl Side {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    fn first_id(self) -> u64 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }
}

/// Result delivered to a waiting caller.
pub type Reply = Result<Bytes, MortarError>;

/// Multiplexer correlating requests with responses.
///
/// Assigns each outgoing request a conversation id and routes the
/// matching response back to the caller waiting on it. Each side can
/// allocate 2^63 ids before the counter wraps; an id still awaiting a
/// response is never handed out twice.
///
/// ## Example
///
/// ```rust
/// use bytes::Bytes;
/// use mortar_transport::{Multiplexer, Side};
///
/// let mux = Multiplexer::new(Side::Client);
///
/// // Register a pending request
/// let (id, mut receiver) = mux.register().unwrap();
/// assert_eq!(id, 1);
///
/// // Later, the receive loop completes it
/// assert!(mux.complete(id, Ok(Bytes::from_static(b"pong"))));
/// assert!(receiver.try_recv().unwrap().is_ok());
/// ```
pub struct Multiplexer {
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Multiplexer {
    /// Create a new multiplexer for one side of a connection.
    #[must_use]
    pub fn new(side: Side) -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(side.first_id()),
            closed: AtomicBool::new(false),
        }
    }

    fn next_candidate(&self) -> u64 {
        loop {
            // Wrapping keeps parity; zero is reserved for control frames
            let id = self.next_id.fetch_add(2, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a new pending request.
    ///
    /// Returns the conversation id and a receiver for the reply.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` once the multiplexer is closed.
    pub fn register(&self) -> Result<(u64, oneshot::Receiver<Reply>), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let id = loop {
            let id = self.next_candidate();
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                if let Some(tx) = tx.take() {
                    slot.insert(tx);
                }
                break id;
            }
        };

        // Close may have drained the table between the check and the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }

        Ok((id, rx))
    }

    /// Allocate a conversation id that expects no reply (events).
    pub fn allocate(&self) -> u64 {
        self.next_candidate()
    }

    /// Deliver a reply to a pending request.
    ///
    /// Returns `true` if a caller was waiting, `false` if no pending request
    /// had that id (e.g., it timed out or was cancelled).
    pub fn complete(&self, id: u64, reply: Reply) -> bool {
        if let Some((_, sender)) = self.pending.remove(&id) {
            // Receiver may have been dropped by a caller that gave up
            let _ = sender.send(reply);
            true
        } else {
            tracing::warn!(conversation_id = id, "no pending request for response");
            false
        }
    }

    /// Drop a pending request without replying.
    pub fn remove(&self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fail every pending request with `error` and refuse new ones.
    ///
    /// Idempotent: later calls find nothing left to fail.
    pub fn close(&self, error: &MortarError) {
        self.closed.store(true, Ordering::Release);

        // Collect keys first to avoid holding shard locks while sending
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in keys {
            if let Some((_, sender)) = self.pending.remove(&id) {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
