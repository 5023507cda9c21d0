//! Connection handles and the transport seam.
//!
//! A [`ConnectionHandle`] is the stable identity the connection manager stores
//! per peer. Its backing state moves `Deferred(buffer) -> Bound(transport) ->
//! Closed`; sends made while deferred are buffered and flushed in order when a
//! transport is bound. Transports never call back into the manager: they push
//! [`ConnectionEvent`]s through an [`EventSink`] into the manager's event loop.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{DhtError, Result};
use crate::identity::{PeerDescriptor, PeerId};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    WebSocketClient,
    WebSocketServer,
    WebRtc,
    Deferred,
}

/// What a transport reports about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport became usable (WebRTC data channel opened).
    Connected,
    Data(Vec<u8>),
    Disconnected { code: u16, reason: String },
    Error(String),
}

#[derive(Debug)]
pub struct TransportEvent {
    pub connection_id: ConnectionId,
    pub event: ConnectionEvent,
}

/// Tags events with the transport's id and forwards them to the manager.
#[derive(Clone, Debug)]
pub struct EventSink {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            tx,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn emit(&self, event: ConnectionEvent) {
        // The receiver only goes away when the manager stops.
        let _ = self.tx.send(TransportEvent {
            connection_id: self.connection_id,
            event,
        });
    }
}

/// A live byte-message link to one remote endpoint.
#[async_trait]
pub trait ConnectionTransport: Send + Sync + 'static {
    fn connection_id(&self) -> ConnectionId;

    fn connection_type(&self) -> ConnectionType;

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    async fn send(&self, data: Vec<u8>) -> Result<()>;

    /// Release the underlying resource. Idempotent.
    async fn close(&self);
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleStatus {
    Deferred,
    Open,
    Closed,
}

enum HandleState {
    Deferred {
        buffer: VecDeque<Vec<u8>>,
    },
    Bound {
        transport: Arc<dyn ConnectionTransport>,
        /// Peer that opened this transport.
        initiator: PeerId,
    },
    Closed,
}

struct HandleInner {
    peer: PeerDescriptor,
    state: HandleState,
}

/// Result of offering a transport to a handle.
#[derive(Debug, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The handle already had a transport, opened by `initiator`.
    AlreadyBound { initiator: PeerId },
}

pub struct ConnectionHandle {
    id: ConnectionId,
    inner: Mutex<HandleInner>,
    status: watch::Sender<HandleStatus>,
}

impl ConnectionHandle {
    /// A placeholder with no transport yet.
    pub fn deferred(peer: PeerDescriptor) -> Arc<Self> {
        let (status, _) = watch::channel(HandleStatus::Deferred);
        Arc::new(Self {
            id: ConnectionId::new(),
            inner: Mutex::new(HandleInner {
                peer,
                state: HandleState::Deferred {
                    buffer: VecDeque::new(),
                },
            }),
            status,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> HandleStatus {
        *self.status.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.status() == HandleStatus::Open
    }

    pub async fn peer_descriptor(&self) -> PeerDescriptor {
        self.inner.lock().await.peer.clone()
    }

    pub async fn set_peer_descriptor(&self, peer: PeerDescriptor) {
        self.inner.lock().await.peer = peer;
    }

    pub async fn connection_type(&self) -> ConnectionType {
        match &self.inner.lock().await.state {
            HandleState::Bound { transport, .. } => transport.connection_type(),
            HandleState::Deferred { .. } | HandleState::Closed => ConnectionType::Deferred,
        }
    }

    pub async fn transport_id(&self) -> Option<ConnectionId> {
        match &self.inner.lock().await.state {
            HandleState::Bound { transport, .. } => Some(transport.connection_id()),
            _ => None,
        }
    }

    pub async fn buffered_len(&self) -> usize {
        match &self.inner.lock().await.state {
            HandleState::Deferred { buffer } => buffer.len(),
            _ => 0,
        }
    }

    /// Send or buffer. Fails once the handle is closed.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match &mut inner.state {
            HandleState::Deferred { buffer } => {
                buffer.push_back(data);
                Ok(())
            }
            HandleState::Bound { transport, .. } => transport.send(data).await,
            HandleState::Closed => Err(DhtError::ConnectionFailed(format!(
                "connection to {} is closed",
                inner.peer
            ))),
        }
    }

    /// Bind a transport to a deferred handle: `preamble` goes out first, then
    /// the buffer in FIFO order. The lock is held throughout so no concurrent
    /// send can overtake a buffered message.
    pub async fn bind(
        &self,
        transport: Arc<dyn ConnectionTransport>,
        initiator: PeerId,
        preamble: Option<Vec<u8>>,
    ) -> Result<BindOutcome> {
        let mut inner = self.inner.lock().await;
        let buffer = match &mut inner.state {
            HandleState::Bound { initiator, .. } => {
                return Ok(BindOutcome::AlreadyBound {
                    initiator: *initiator,
                })
            }
            HandleState::Closed => {
                return Err(DhtError::IllegalPeerConnectionState(format!(
                    "cannot bind a transport to closed connection {}",
                    self.id
                )))
            }
            HandleState::Deferred { buffer } => std::mem::take(buffer),
        };

        trace!(connection = %self.id, peer = %inner.peer, buffered = buffer.len(), "binding transport");
        if let Err(err) = flush(transport.as_ref(), preamble, buffer).await {
            inner.state = HandleState::Closed;
            self.status.send_replace(HandleStatus::Closed);
            transport.close().await;
            return Err(err);
        }
        inner.state = HandleState::Bound {
            transport,
            initiator,
        };
        self.status.send_replace(HandleStatus::Open);
        Ok(BindOutcome::Bound)
    }

    /// Swap the transport of a bound handle, returning the previous one.
    pub async fn replace_transport(
        &self,
        transport: Arc<dyn ConnectionTransport>,
        initiator: PeerId,
        preamble: Option<Vec<u8>>,
    ) -> Result<Option<Arc<dyn ConnectionTransport>>> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, HandleState::Closed) {
            return Err(DhtError::IllegalPeerConnectionState(format!(
                "cannot replace the transport of closed connection {}",
                self.id
            )));
        }
        flush(transport.as_ref(), preamble, VecDeque::new()).await?;
        let previous = std::mem::replace(
            &mut inner.state,
            HandleState::Bound {
                transport,
                initiator,
            },
        );
        self.status.send_replace(HandleStatus::Open);
        Ok(match previous {
            HandleState::Bound { transport, .. } => Some(transport),
            _ => None,
        })
    }

    /// Close the handle and its transport. Buffered messages are dropped.
    pub async fn close(&self) {
        let previous = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut inner.state, HandleState::Closed)
        };
        self.status.send_replace(HandleStatus::Closed);
        match previous {
            HandleState::Bound { transport, .. } => transport.close().await,
            HandleState::Deferred { buffer } if !buffer.is_empty() => {
                debug!(connection = %self.id, dropped = buffer.len(), "closing deferred connection");
            }
            _ => {}
        }
    }

    /// Mark closed if `transport_id` is the bound transport; the transport is
    /// already gone so it is not closed again.
    pub async fn detach(&self, transport_id: ConnectionId) -> bool {
        let mut inner = self.inner.lock().await;
        let matches = matches!(
            &inner.state,
            HandleState::Bound { transport, .. } if transport.connection_id() == transport_id
        );
        if matches {
            inner.state = HandleState::Closed;
            self.status.send_replace(HandleStatus::Closed);
        }
        matches
    }

    /// Wait until the handle leaves the deferred state.
    pub async fn wait_open(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.subscribe();
        let reached = tokio::time::timeout(timeout, status.wait_for(|s| *s != HandleStatus::Deferred)).await;
        match reached {
            Ok(Ok(current)) if *current == HandleStatus::Open => Ok(()),
            Ok(_) => Err(DhtError::ConnectionFailed(format!("connection {} closed", self.id))),
            Err(_) => Err(DhtError::ConnectionFailed(format!(
                "connection {} not established within {timeout:?}",
                self.id
            ))),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

async fn flush(
    transport: &dyn ConnectionTransport,
    preamble: Option<Vec<u8>>,
    buffer: VecDeque<Vec<u8>>,
) -> Result<()> {
    if let Some(first) = preamble {
        transport.send(first).await?;
    }
    for data in buffer {
        transport.send(data).await?;
    }
    Ok(())
}
