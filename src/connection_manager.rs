//! The connection manager: sole owner of the peer -> connection map.
//!
//! Every transport, whichever connector produced it, reports through one event
//! channel consumed by a single loop task. That loop binds handshakes to
//! [`ConnectionHandle`]s, answers connectivity probes and demultiplexes the
//! remaining envelopes by `app_id`.
//!
//! Outbound [`send`](ConnectionManager::send) picks a connector per target:
//!
//! 1. an existing handle (deferred handles buffer),
//! 2. a WebSocket dial when the target advertises an address,
//! 3. a reverse `requestConnection` when only we are reachable,
//! 4. WebRTC otherwise.
//!
//! Duplicate links to the same peer are resolved by keeping the transport
//! whose initiator has the smaller peer id; on a tie the newer one wins.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionManagerConfig;
use crate::connection::{
    BindOutcome, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionTransport,
    ConnectionType, HandleStatus, TransportEvent,
};
use crate::error::{DhtError, Result};
use crate::identity::{ConnectivityMethod, PeerDescriptor, PeerId};
use crate::protocol::{
    encode_body, ConnectivityRequest, ConnectivityResponse, HandshakeMessage, Message, MessageType, NatType,
    WebSocketConnectionRequest, CONNECTION_MANAGER_APP_ID, PROTOCOL_VERSION,
    WEBRTC_CONNECTOR_APP_ID, WEBSOCKET_CONNECTOR_APP_ID,
};
use crate::rpc::{IncomingMessage, Transport};
use crate::webrtc::{WebRtcConnector, WebRtcRuntime};
use crate::websocket::{self, ServerConnection, WebSocketConnector, WebSocketServer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum Lifecycle {
    #[default]
    Created,
    Started,
    Stopped,
}

/// What the manager knows about a transport.
enum TransportRole {
    /// Waiting for the remote handshake.
    Unidentified,
    /// Our own link that is usable once it reports `Connected`.
    Pending { peer: PeerDescriptor, initiator: PeerId },
    /// Bound (or being bound) to the handle of `peer`.
    Owned { peer: PeerId },
    /// Outgoing connectivity probe awaiting its response.
    Probe(Option<oneshot::Sender<ConnectivityResponse>>),
}

struct TransportEntry {
    transport: Arc<dyn ConnectionTransport>,
    role: TransportRole,
}

#[derive(Default)]
struct ManagerState {
    lifecycle: Lifecycle,
    local: Option<PeerDescriptor>,
    connections: HashMap<PeerId, Arc<ConnectionHandle>>,
    transports: HashMap<ConnectionId, TransportEntry>,
    disconnect_timers: HashMap<PeerId, JoinHandle<()>>,
    server: Option<WebSocketServer>,
    event_loop: Option<JoinHandle<()>>,
}

type Inbound = (
    mpsc::UnboundedReceiver<TransportEvent>,
    mpsc::UnboundedReceiver<Arc<ServerConnection>>,
);

pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    config: ConnectionManagerConfig,
    state: Mutex<ManagerState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    accepted: mpsc::UnboundedSender<Arc<ServerConnection>>,
    inbound: Mutex<Option<Inbound>>,
    websocket: WebSocketConnector,
    webrtc: Arc<WebRtcConnector>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<IncomingMessage>>>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig) -> Result<Arc<Self>> {
        let runtime = WebRtcRuntime::new(&config.webrtc)?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        Ok(Arc::new_cyclic(|me: &Weak<Self>| Self {
            me: me.clone(),
            websocket: WebSocketConnector::new(me.clone(), events.clone(), config.connect_timeout),
            webrtc: WebRtcConnector::new(config.webrtc.clone(), runtime, me.clone(), events.clone()),
            config,
            state: Mutex::new(ManagerState::default()),
            events,
            accepted,
            inbound: Mutex::new(Some((events_rx, accepted_rx))),
            subscribers: Mutex::new(HashMap::new()),
        }))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the event loop and the WebSocket server, then find out whether
    /// this node is reachable from outside.
    pub async fn start(&self) -> Result<ConnectivityResponse> {
        {
            let mut state = self.state.lock().await;
            match state.lifecycle {
                Lifecycle::Created => {}
                Lifecycle::Started => return Err(DhtError::CouldNotStart("already started".into())),
                Lifecycle::Stopped => return Err(DhtError::CouldNotStart("already stopped".into())),
            }
            let (events, accepted) = self
                .inbound
                .lock()
                .await
                .take()
                .ok_or_else(|| DhtError::CouldNotStart("event loop already consumed".into()))?;
            state.event_loop = Some(tokio::spawn(run_event_loop(self.me.clone(), events, accepted)));
            state.lifecycle = Lifecycle::Started;
        }

        let host = self.config.websocket_host.clone();
        let Some(port) = self.config.websocket_port else {
            info!("no websocket server configured");
            return Ok(ConnectivityResponse {
                open_internet: false,
                ip: host,
                nat_type: NatType::Unknown,
                websocket: None,
            });
        };

        let server = WebSocketServer::bind(&host, port, self.events.clone(), self.accepted.clone())
            .await
            .map_err(|err| DhtError::CouldNotStart(format!("websocket server on {host}:{port}: {err}")))?;
        let own = ConnectivityMethod::new(host.clone(), server.local_addr().port());
        self.state.lock().await.server = Some(server);

        let entry = self
            .config
            .entry_points
            .first()
            .and_then(|entry| entry.websocket.clone());
        match entry {
            Some(entry) if entry != own => match self.probe_connectivity(&entry, own.port).await {
                Ok(response) => {
                    info!(open_internet = response.open_internet, ip = %response.ip, "connectivity probe finished");
                    Ok(response)
                }
                Err(err) => {
                    warn!(%entry, "connectivity probe failed: {err}");
                    Ok(ConnectivityResponse {
                        open_internet: false,
                        ip: host,
                        nat_type: NatType::Unknown,
                        websocket: None,
                    })
                }
            },
            _ => Ok(ConnectivityResponse {
                open_internet: true,
                ip: host,
                nat_type: NatType::OpenInternet,
                websocket: Some(own),
            }),
        }
    }

    /// Bind the local descriptor and give both connectors a signaling path.
    pub async fn enable_connectivity(
        &self,
        local: PeerDescriptor,
        signaling: Arc<dyn Transport>,
        rpc_timeout: Duration,
    ) {
        self.state.lock().await.local = Some(local.clone());
        self.websocket
            .enable(local.clone(), signaling.clone(), rpc_timeout)
            .await;
        self.webrtc.enable(local, signaling, rpc_timeout).await;
    }

    /// Close the server, the connectors, every connection and every timer.
    pub async fn stop(&self) -> Result<()> {
        let (handles, transports, timers, server, event_loop) = {
            let mut state = self.state.lock().await;
            match state.lifecycle {
                Lifecycle::Created => return Err(DhtError::CouldNotStop("not started".into())),
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Started => {}
            }
            state.lifecycle = Lifecycle::Stopped;
            (
                state.connections.drain().map(|(_, h)| h).collect::<Vec<_>>(),
                state
                    .transports
                    .drain()
                    .map(|(_, e)| e.transport)
                    .collect::<Vec<_>>(),
                state.disconnect_timers.drain().map(|(_, t)| t).collect::<Vec<_>>(),
                state.server.take(),
                state.event_loop.take(),
            )
        };

        if let Some(task) = event_loop {
            task.abort();
        }
        for timer in timers {
            timer.abort();
        }
        if let Some(server) = server {
            server.stop();
        }
        self.websocket.stop().await;
        self.webrtc.stop().await;
        for handle in handles {
            handle.close().await;
        }
        for transport in transports {
            transport.close().await;
        }
        self.subscribers.lock().await.clear();
        info!("connection manager stopped");
        Ok(())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Deliver `message` to `target`, opening a connection when needed.
    ///
    /// The handle is registered before establishment starts, so concurrent
    /// sends to the same peer buffer behind the first one and resolve with
    /// it. A failed establishment rejects every such call and discards the
    /// handle.
    pub async fn send(&self, message: Message, target: &PeerDescriptor) -> Result<()> {
        let local = self.local_descriptor().await.ok_or(DhtError::NotRunning)?;
        if target.peer_id == local.peer_id {
            return Err(DhtError::CannotConnectToSelf);
        }
        let data = message.encode()?;

        let (handle, fresh) = {
            let mut state = self.state.lock().await;
            if state.lifecycle != Lifecycle::Started {
                return Err(DhtError::NotRunning);
            }
            if let Some(timer) = state.disconnect_timers.remove(&target.peer_id) {
                timer.abort();
                trace!(peer = %target, "pending disconnect cancelled by send");
            }
            match state.connections.get(&target.peer_id) {
                Some(handle) if handle.status() != HandleStatus::Closed => (handle.clone(), false),
                _ => {
                    let handle = ConnectionHandle::deferred(target.clone());
                    state.connections.insert(target.peer_id, handle.clone());
                    (handle, true)
                }
            }
        };

        handle.send(data).await?;
        if !fresh {
            if handle.status() == HandleStatus::Deferred {
                // Buffered behind an establishment started elsewhere; its
                // failure drops the buffer, so it fails this send too.
                return handle
                    .wait_open(self.establishment_timeout(&local, target))
                    .await;
            }
            return Ok(());
        }
        if let Err(err) = self.establish(&local, target, &handle).await {
            debug!(peer = %target, "connection failed: {err}");
            self.discard(&target.peer_id, &handle).await;
            return Err(err);
        }
        Ok(())
    }

    async fn establish(
        &self,
        local: &PeerDescriptor,
        target: &PeerDescriptor,
        handle: &Arc<ConnectionHandle>,
    ) -> Result<()> {
        if let Some(address) = &target.websocket {
            return self.open_websocket(local, target, address).await;
        }
        if let Some(own) = &local.websocket {
            debug!(peer = %target, "asking peer to connect back over websocket");
            self.websocket.request_connection(local, target, own).await?;
            return handle.wait_open(self.config.connect_timeout).await;
        }
        debug!(peer = %target, "opening webrtc connection");
        self.webrtc.connect(target).await?;
        handle.wait_open(self.webrtc.connecting_timeout()).await
    }

    fn establishment_timeout(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> Duration {
        if target.websocket.is_some() || local.websocket.is_some() {
            self.config.connect_timeout
        } else {
            self.webrtc.connecting_timeout()
        }
    }

    async fn open_websocket(
        &self,
        local: &PeerDescriptor,
        target: &PeerDescriptor,
        address: &ConnectivityMethod,
    ) -> Result<()> {
        let connection = self.websocket.connect(address).await?;
        self.register(connection.clone(), TransportRole::Unidentified)
            .await;
        connection.start();
        let transport: Arc<dyn ConnectionTransport> = connection;
        if let Err(err) = self
            .attach(transport.clone(), target.clone(), local.peer_id, local)
            .await
        {
            self.forget_transport(transport.connection_id()).await;
            transport.close().await;
            return Err(err);
        }
        Ok(())
    }

    /// Dial `peer` over WebSocket on behalf of a reverse connection request.
    pub(crate) async fn connect_websocket(&self, peer: PeerDescriptor) -> Result<()> {
        let local = self.local_descriptor().await.ok_or(DhtError::NotRunning)?;
        let address = peer
            .websocket
            .clone()
            .ok_or_else(|| DhtError::ConnectionFailed(format!("{peer} has no websocket address")))?;
        if self.has_open_connection(&peer.peer_id).await {
            return Ok(());
        }
        let handle = self.ensure_deferred(&peer).await;
        if let Err(err) = self.open_websocket(&local, &peer, &address).await {
            if handle.status() == HandleStatus::Deferred {
                self.discard(&peer.peer_id, &handle).await;
            }
            return Err(err);
        }
        Ok(())
    }

    pub(crate) async fn can_accept_connection_request(
        &self,
        request: &WebSocketConnectionRequest,
    ) -> std::result::Result<(), String> {
        let state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Started {
            return Err("not running".to_string());
        }
        match &state.local {
            Some(local) if local.peer_id == request.target.peer_id => {}
            Some(_) => return Err("request addressed to another peer".to_string()),
            None => return Err("connectivity not enabled".to_string()),
        }
        if request.requester.peer_id == request.target.peer_id {
            return Err("requester asked to connect to itself".to_string());
        }
        Ok(())
    }

    /// Schedule closing the connection to `peer`. A later [`send`] to the same
    /// peer cancels it.
    ///
    /// [`send`]: ConnectionManager::send
    pub async fn disconnect(&self, peer: &PeerId, reason: &str, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(self.config.disconnection_timeout);
        let manager = self.me.clone();
        let peer_id = *peer;
        let reason = reason.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.close_connection(&peer_id, &reason).await;
            }
        });
        let mut state = self.state.lock().await;
        if let Some(previous) = state.disconnect_timers.insert(*peer, timer) {
            previous.abort();
        }
    }

    async fn close_connection(&self, peer: &PeerId, reason: &str) {
        let handle = {
            let mut state = self.state.lock().await;
            state.disconnect_timers.remove(peer);
            state.connections.remove(peer)
        };
        if let Some(handle) = handle {
            debug!(peer = %peer.short(), %reason, "disconnecting");
            handle.close().await;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn local_descriptor(&self) -> Option<PeerDescriptor> {
        self.state.lock().await.local.clone()
    }

    pub async fn has_connection(&self, peer: &PeerId) -> bool {
        self.state.lock().await.connections.contains_key(peer)
    }

    pub async fn has_open_connection(&self, peer: &PeerId) -> bool {
        self.state
            .lock()
            .await
            .connections
            .get(peer)
            .is_some_and(|handle| handle.is_open())
    }

    pub async fn get_connection(&self, peer: &PeerId) -> Option<Arc<ConnectionHandle>> {
        self.state.lock().await.connections.get(peer).cloned()
    }

    pub async fn connection_type(&self, peer: &PeerId) -> Option<ConnectionType> {
        let handle = self.get_connection(peer).await?;
        Some(handle.connection_type().await)
    }

    /// Descriptors of peers with an open connection.
    pub async fn connected_peers(&self) -> Vec<PeerDescriptor> {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .state
            .lock()
            .await
            .connections
            .values()
            .filter(|handle| handle.is_open())
            .cloned()
            .collect();
        let mut peers = Vec::with_capacity(handles.len());
        for handle in handles {
            peers.push(handle.peer_descriptor().await);
        }
        peers
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Receive every envelope whose `app_id` matches, direct or routed.
    pub async fn subscribe(&self, app_id: &str) -> mpsc::UnboundedReceiver<IncomingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .entry(app_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Hand a message that arrived through DHT routing to its subsystem.
    pub async fn deliver_routed(&self, source: PeerDescriptor, message: Message) {
        self.dispatch(source, message).await;
    }

    // ========================================================================
    // Connector hooks
    // ========================================================================

    /// Make sure `peer` has a handle, creating a deferred one if needed.
    pub(crate) async fn ensure_deferred(&self, peer: &PeerDescriptor) -> Arc<ConnectionHandle> {
        let mut state = self.state.lock().await;
        match state.connections.get(&peer.peer_id) {
            Some(handle) if handle.status() != HandleStatus::Closed => handle.clone(),
            _ => {
                let handle = ConnectionHandle::deferred(peer.clone());
                state.connections.insert(peer.peer_id, handle.clone());
                handle
            }
        }
    }

    /// Track a transport that becomes usable once it reports `Connected`.
    pub(crate) async fn register_pending_transport(
        &self,
        transport: Arc<dyn ConnectionTransport>,
        peer: PeerDescriptor,
        initiator: PeerId,
    ) {
        self.register(transport, TransportRole::Pending { peer, initiator })
            .await;
    }

    /// A WebRTC negotiation gave up; fail whoever waits on the handle.
    pub(crate) async fn on_webrtc_failed(&self, peer: PeerId) {
        let handle = {
            let mut state = self.state.lock().await;
            match state.connections.get(&peer) {
                Some(handle) if handle.status() == HandleStatus::Deferred => state.connections.remove(&peer),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    // ========================================================================
    // Event loop handlers
    // ========================================================================

    async fn register(&self, transport: Arc<dyn ConnectionTransport>, role: TransportRole) {
        let id = transport.connection_id();
        trace!(connection = %id, kind = ?transport.connection_type(), "transport registered");
        self.state
            .lock()
            .await
            .transports
            .insert(id, TransportEntry { transport, role });
    }

    async fn forget_transport(&self, id: ConnectionId) {
        self.state.lock().await.transports.remove(&id);
    }

    async fn transport(&self, id: ConnectionId) -> Option<Arc<dyn ConnectionTransport>> {
        self.state
            .lock()
            .await
            .transports
            .get(&id)
            .map(|entry| entry.transport.clone())
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        let id = event.connection_id;
        match event.event {
            ConnectionEvent::Connected => self.on_connected(id).await,
            ConnectionEvent::Data(data) => self.on_data(id, data).await,
            ConnectionEvent::Disconnected { code, reason } => {
                self.on_disconnected(id, code, reason).await
            }
            ConnectionEvent::Error(err) => debug!(connection = %id, "transport error: {err}"),
        }
    }

    async fn on_connected(&self, id: ConnectionId) {
        let pending = {
            let state = self.state.lock().await;
            match state.transports.get(&id) {
                Some(TransportEntry {
                    transport,
                    role: TransportRole::Pending { peer, initiator },
                }) => Some((transport.clone(), peer.clone(), *initiator)),
                _ => None,
            }
        };
        let Some((transport, peer, initiator)) = pending else {
            return;
        };
        let Some(local) = self.local_descriptor().await else {
            return;
        };
        if let Err(err) = self.attach(transport.clone(), peer.clone(), initiator, &local).await {
            debug!(peer = %peer, "attaching transport failed: {err}");
            self.forget_transport(id).await;
            transport.close().await;
        }
    }

    async fn on_data(&self, id: ConnectionId, data: Vec<u8>) {
        let message = match Message::decode(&data) {
            Ok(message) => message,
            Err(err) => {
                debug!(connection = %id, "dropping frame: {err}");
                return;
            }
        };

        if message.app_id == CONNECTION_MANAGER_APP_ID {
            self.on_control_message(id, message).await;
            return;
        }

        let owner = {
            let state = self.state.lock().await;
            match state.transports.get(&id).map(|entry| &entry.role) {
                Some(TransportRole::Owned { peer }) => state.connections.get(peer).cloned(),
                _ => None,
            }
        };
        let Some(handle) = owner else {
            debug!(connection = %id, app_id = %message.app_id, "dropping message received before handshake");
            return;
        };
        let sender = handle.peer_descriptor().await;
        self.dispatch(sender, message).await;
    }

    async fn on_control_message(&self, id: ConnectionId, message: Message) {
        match message.message_type {
            MessageType::Handshake => match message.body_as::<HandshakeMessage>() {
                Ok(handshake) => self.on_handshake(id, handshake).await,
                Err(err) => debug!(connection = %id, "bad handshake: {err}"),
            },
            MessageType::ConnectivityRequest => {
                let request = match message.body_as::<ConnectivityRequest>() {
                    Ok(request) => request,
                    Err(err) => {
                        debug!(connection = %id, "bad connectivity request: {err}");
                        return;
                    }
                };
                let (Some(transport), Some(manager)) = (self.transport(id).await, self.me.upgrade()) else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = manager.answer_connectivity_request(transport, request).await {
                        debug!("connectivity response failed: {err}");
                    }
                });
            }
            MessageType::ConnectivityResponse => {
                let response = match message.body_as::<ConnectivityResponse>() {
                    Ok(response) => response,
                    Err(err) => {
                        debug!(connection = %id, "bad connectivity response: {err}");
                        return;
                    }
                };
                let waiter = {
                    let mut state = self.state.lock().await;
                    match state.transports.get_mut(&id).map(|entry| &mut entry.role) {
                        Some(TransportRole::Probe(waiter)) => waiter.take(),
                        _ => None,
                    }
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(response);
                }
            }
            MessageType::Rpc => {
                debug!(connection = %id, "unexpected rpc envelope for the connection manager")
            }
        }
    }

    async fn on_handshake(&self, id: ConnectionId, handshake: HandshakeMessage) {
        let Some(local) = self.local_descriptor().await else {
            debug!(connection = %id, "handshake before connectivity was enabled");
            let entry = self.state.lock().await.transports.remove(&id);
            if let Some(entry) = entry {
                entry.transport.close().await;
            }
            return;
        };
        let peer = handshake.peer_descriptor;
        if handshake.source_id != peer.peer_id {
            warn!(connection = %id, "handshake source does not match its descriptor");
            return;
        }
        if handshake.protocol_version != PROTOCOL_VERSION {
            warn!(peer = %peer, version = %handshake.protocol_version, "protocol version mismatch");
        }

        enum Next {
            Refresh(Option<Arc<ConnectionHandle>>),
            Attach(Arc<dyn ConnectionTransport>, PeerId),
            CloseSelf(Arc<dyn ConnectionTransport>),
            Ignore,
        }

        let next = {
            let state = self.state.lock().await;
            match state.transports.get(&id) {
                None => Next::Ignore,
                Some(entry) if peer.peer_id == local.peer_id => Next::CloseSelf(entry.transport.clone()),
                Some(entry) => match &entry.role {
                    TransportRole::Owned { peer: owner } if *owner == peer.peer_id => {
                        Next::Refresh(state.connections.get(owner).cloned())
                    }
                    TransportRole::Owned { .. } | TransportRole::Probe(_) => Next::Ignore,
                    TransportRole::Pending { initiator, .. } => {
                        Next::Attach(entry.transport.clone(), *initiator)
                    }
                    TransportRole::Unidentified => Next::Attach(entry.transport.clone(), peer.peer_id),
                },
            }
        };

        match next {
            Next::Refresh(Some(handle)) => handle.set_peer_descriptor(peer).await,
            Next::Refresh(None) | Next::Ignore => {}
            Next::CloseSelf(transport) => {
                warn!(connection = %id, "peer handshaked with our own id");
                self.forget_transport(id).await;
                transport.close().await;
            }
            Next::Attach(transport, initiator) => {
                if let Err(err) = self.attach(transport.clone(), peer.clone(), initiator, &local).await {
                    debug!(peer = %peer, "accepting connection failed: {err}");
                    self.forget_transport(id).await;
                    transport.close().await;
                }
            }
        }
    }

    /// Bind `transport` to the handle of `peer`, handshake first.
    async fn attach(
        &self,
        transport: Arc<dyn ConnectionTransport>,
        peer: PeerDescriptor,
        initiator: PeerId,
        local: &PeerDescriptor,
    ) -> Result<()> {
        let preamble = HandshakeMessage::envelope(local)?.encode()?;
        let transport_id = transport.connection_id();
        let handle = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.transports.get_mut(&transport_id) else {
                return Err(DhtError::ConnectionFailed(format!(
                    "transport {transport_id} went away before the handshake"
                )));
            };
            entry.role = TransportRole::Owned { peer: peer.peer_id };
            match state.connections.get(&peer.peer_id) {
                Some(handle) if handle.status() != HandleStatus::Closed => handle.clone(),
                _ => {
                    let handle = ConnectionHandle::deferred(peer.clone());
                    state.connections.insert(peer.peer_id, handle.clone());
                    handle
                }
            }
        };
        handle.set_peer_descriptor(peer.clone()).await;

        match handle.bind(transport.clone(), initiator, Some(preamble.clone())).await {
            Ok(BindOutcome::Bound) => {
                debug!(peer = %peer, kind = ?transport.connection_type(), "connection open");
                self.on_opened(&peer.peer_id, transport.as_ref()).await;
                Ok(())
            }
            Ok(BindOutcome::AlreadyBound { initiator: current }) => {
                self.resolve_duplicate(&peer, &handle, transport, initiator, current, preamble)
                    .await
            }
            Err(err) => {
                self.remove_handle(&peer.peer_id, &handle).await;
                Err(err)
            }
        }
    }

    async fn resolve_duplicate(
        &self,
        peer: &PeerDescriptor,
        handle: &Arc<ConnectionHandle>,
        transport: Arc<dyn ConnectionTransport>,
        initiator: PeerId,
        current: PeerId,
        preamble: Vec<u8>,
    ) -> Result<()> {
        if initiator > current {
            debug!(peer = %peer, "keeping existing connection, closing duplicate");
            self.forget_transport(transport.connection_id()).await;
            transport.close().await;
            return Ok(());
        }
        let previous = handle
            .replace_transport(transport.clone(), initiator, Some(preamble))
            .await?;
        if let Some(previous) = previous {
            debug!(peer = %peer, "replacing duplicate connection");
            self.forget_transport(previous.connection_id()).await;
            previous.close().await;
        }
        self.on_opened(&peer.peer_id, transport.as_ref()).await;
        Ok(())
    }

    async fn on_opened(&self, peer: &PeerId, transport: &dyn ConnectionTransport) {
        if transport.connection_type() == ConnectionType::WebRtc {
            self.webrtc
                .mark_connected(peer, transport.connection_id())
                .await;
        }
    }

    async fn on_disconnected(&self, id: ConnectionId, code: u16, reason: String) {
        let (entry, handle) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.transports.remove(&id) else {
                trace!(connection = %id, "disconnect of an untracked transport");
                return;
            };
            let handle = match &entry.role {
                TransportRole::Owned { peer } => state.connections.get(peer).cloned(),
                _ => None,
            };
            (entry, handle)
        };

        match entry.role {
            TransportRole::Owned { peer } => {
                if let Some(handle) = handle {
                    if handle.detach(id).await {
                        debug!(peer = %peer.short(), code, %reason, "connection closed by transport");
                        self.remove_handle(&peer, &handle).await;
                    }
                }
                if entry.transport.connection_type() == ConnectionType::WebRtc {
                    self.webrtc.on_disconnected(&peer, id).await;
                }
            }
            TransportRole::Pending { peer, .. } => {
                self.webrtc.on_disconnected(&peer.peer_id, id).await;
            }
            TransportRole::Probe(_) | TransportRole::Unidentified => {
                trace!(connection = %id, code, %reason, "anonymous transport closed");
            }
        }
    }

    async fn answer_connectivity_request(
        &self,
        transport: Arc<dyn ConnectionTransport>,
        request: ConnectivityRequest,
    ) -> Result<()> {
        let ip = transport
            .remote_address()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        let target = ConnectivityMethod::new(ip.clone(), request.port);
        let reachable = match websocket::connect(&target, self.events.clone(), self.config.connectivity_timeout).await {
            Ok(probe) => {
                probe.close().await;
                true
            }
            Err(err) => {
                debug!(%target, "connect-back failed: {err}");
                false
            }
        };
        let response = ConnectivityResponse {
            open_internet: reachable,
            ip,
            nat_type: if reachable {
                NatType::OpenInternet
            } else {
                NatType::Unknown
            },
            websocket: reachable.then_some(target),
        };
        let message = Message::new(
            CONNECTION_MANAGER_APP_ID,
            MessageType::ConnectivityResponse,
            encode_body(&response)?,
        );
        transport.send(message.encode()?).await
    }

    async fn probe_connectivity(
        &self,
        entry: &ConnectivityMethod,
        port: u16,
    ) -> Result<ConnectivityResponse> {
        let connection = self.websocket.connect(entry).await?;
        let (tx, rx) = oneshot::channel();
        self.register(connection.clone(), TransportRole::Probe(Some(tx)))
            .await;
        connection.start();

        let result = async {
            let request = Message::new(
                CONNECTION_MANAGER_APP_ID,
                MessageType::ConnectivityRequest,
                encode_body(&ConnectivityRequest { port })?,
            );
            connection.send(request.encode()?).await?;
            match tokio::time::timeout(self.config.connect_timeout, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(DhtError::ConnectionFailed("probe connection closed".into())),
                Err(_) => Err(DhtError::ConnectionFailed("connectivity probe timed out".into())),
            }
        }
        .await;
        connection.close().await;
        result
    }

    async fn dispatch(&self, sender: PeerDescriptor, message: Message) {
        let incoming = IncomingMessage { sender, message };
        match incoming.message.app_id.as_str() {
            WEBRTC_CONNECTOR_APP_ID => self.webrtc.deliver(incoming).await,
            WEBSOCKET_CONNECTOR_APP_ID => self.websocket.deliver(incoming).await,
            app_id => {
                let mut subscribers = self.subscribers.lock().await;
                match subscribers.get_mut(app_id) {
                    Some(listeners) => listeners.retain(|tx| tx.send(incoming.clone()).is_ok()),
                    None => trace!(%app_id, "no subscriber for message"),
                }
            }
        }
    }

    async fn remove_handle(&self, peer: &PeerId, handle: &Arc<ConnectionHandle>) {
        let mut state = self.state.lock().await;
        if state
            .connections
            .get(peer)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            state.connections.remove(peer);
        }
    }

    async fn discard(&self, peer: &PeerId, handle: &Arc<ConnectionHandle>) {
        self.remove_handle(peer, handle).await;
        handle.close().await;
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn send(&self, message: Message, target: &PeerDescriptor) -> Result<()> {
        ConnectionManager::send(self, message, target).await
    }
}

async fn run_event_loop(
    manager: Weak<ConnectionManager>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut accepted: mpsc::UnboundedReceiver<Arc<ServerConnection>>,
) {
    loop {
        tokio::select! {
            biased;
            Some(connection) = accepted.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.register(connection.clone(), TransportRole::Unidentified).await;
                connection.start();
            }
            Some(event) = events.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.on_transport_event(event).await;
            }
            else => break,
        }
    }
    trace!("connection manager event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_peer_id;
    use crate::protocol::DHT_APP_ID;

    struct NoSignaling;

    #[async_trait]
    impl Transport for NoSignaling {
        async fn send(&self, _message: Message, target: &PeerDescriptor) -> Result<()> {
            Err(DhtError::CouldNotRoute(format!("no route to {target}")))
        }
    }

    async fn enabled_manager(name: &str) -> (Arc<ConnectionManager>, PeerDescriptor) {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default()).expect("manager");
        manager.start().await.expect("start");
        let local = PeerDescriptor::new(derive_peer_id(name));
        manager
            .enable_connectivity(local.clone(), Arc::new(NoSignaling), Duration::from_secs(1))
            .await;
        (manager, local)
    }

    async fn listening_manager(name: &str) -> (Arc<ConnectionManager>, PeerDescriptor) {
        let config = ConnectionManagerConfig {
            websocket_port: Some(0),
            ..ConnectionManagerConfig::default()
        };
        let manager = ConnectionManager::new(config).expect("manager");
        let connectivity = manager.start().await.expect("start");
        let mut local = PeerDescriptor::new(derive_peer_id(name));
        local.websocket = connectivity.websocket;
        manager
            .enable_connectivity(local.clone(), Arc::new(NoSignaling), Duration::from_secs(1))
            .await;
        (manager, local)
    }

    /// The one transport `manager` tracks, once the duplicates are gone.
    async fn sole_transport(manager: &ConnectionManager, peer: &PeerId) -> Option<ConnectionType> {
        let handle = manager.get_connection(peer).await?;
        let bound = handle.transport_id().await?;
        let state = manager.state.lock().await;
        if state.transports.len() != 1 || !state.transports.contains_key(&bound) {
            return None;
        }
        Some(state.transports[&bound].transport.connection_type())
    }

    #[tokio::test]
    async fn lifecycle_rejects_misuse() {
        let manager = ConnectionManager::new(ConnectionManagerConfig::default()).expect("manager");
        assert!(matches!(manager.stop().await, Err(DhtError::CouldNotStop(_))));

        let response = manager.start().await.expect("first start");
        assert!(!response.open_internet, "no server means not reachable");
        assert!(response.websocket.is_none());
        assert!(matches!(manager.start().await, Err(DhtError::CouldNotStart(_))));

        manager.stop().await.expect("stop");
        manager.stop().await.expect("stop is idempotent");
        assert!(matches!(manager.start().await, Err(DhtError::CouldNotStart(_))));
    }

    #[tokio::test]
    async fn sending_to_self_fails() {
        let (manager, local) = enabled_manager("self-sender").await;
        let message = Message::new(DHT_APP_ID, MessageType::Rpc, Vec::new());
        let err = manager.send(message, &local).await.expect_err("self send must fail");
        assert!(matches!(err, DhtError::CannotConnectToSelf));
        assert_eq!(manager.connection_count().await, 0);
        manager.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn routed_messages_reach_subscribers() {
        let (manager, _local) = enabled_manager("subscriber").await;
        let mut inbox = manager.subscribe("app").await;
        let source = PeerDescriptor::new(derive_peer_id("far-away"));
        let message = Message::new("app", MessageType::Rpc, b"payload".to_vec());
        manager.deliver_routed(source.clone(), message.clone()).await;

        let incoming = inbox.recv().await.expect("delivered");
        assert_eq!(incoming.sender, source);
        assert_eq!(incoming.message, message);
        manager.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn simultaneous_dials_keep_the_lower_initiators_link() {
        let (alpha, alpha_local) = listening_manager("alpha").await;
        let (beta, beta_local) = listening_manager("beta").await;

        let (to_beta, to_alpha) = tokio::join!(
            alpha.send(Message::new("app", MessageType::Rpc, b"hi beta".to_vec()), &beta_local),
            beta.send(Message::new("app", MessageType::Rpc, b"hi alpha".to_vec()), &alpha_local),
        );
        to_beta.expect("alpha dials beta");
        to_alpha.expect("beta dials alpha");

        // Both sides keep the link dialed by the smaller id: the client end on
        // its side, the server end on the other.
        let (lower, lower_remote, higher, higher_remote) = if alpha_local.peer_id < beta_local.peer_id {
            (&alpha, beta_local.peer_id, &beta, alpha_local.peer_id)
        } else {
            (&beta, alpha_local.peer_id, &alpha, beta_local.peer_id)
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let settled = sole_transport(lower, &lower_remote).await == Some(ConnectionType::WebSocketClient)
                && sole_transport(higher, &higher_remote).await == Some(ConnectionType::WebSocketServer);
            if settled {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "duplicate links did not settle on one transport per side"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(lower.has_open_connection(&lower_remote).await);
        assert!(higher.has_open_connection(&higher_remote).await);

        alpha.stop().await.expect("stop alpha");
        beta.stop().await.expect("stop beta");
    }

    #[tokio::test]
    async fn handshake_before_enable_closes_the_transport() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let config = ConnectionManagerConfig {
            websocket_port: Some(0),
            ..ConnectionManagerConfig::default()
        };
        let manager = ConnectionManager::new(config).expect("manager");
        let address = manager
            .start()
            .await
            .expect("start")
            .websocket
            .expect("listening");

        let (mut socket, _) = tokio_tungstenite::connect_async(address.url().as_str())
            .await
            .expect("dial");
        let early = PeerDescriptor::new(derive_peer_id("early"));
        let handshake = HandshakeMessage::envelope(&early)
            .and_then(|envelope| envelope.encode())
            .expect("handshake");
        socket.send(WsMessage::Binary(handshake)).await.expect("send handshake");

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match socket.next().await {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "the unidentified link is closed");
        assert!(manager.state.lock().await.transports.is_empty());
        manager.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn failed_establishment_discards_handle() {
        let (manager, _local) = enabled_manager("lonely").await;
        let target = PeerDescriptor::new(derive_peer_id("unreachable"));
        let message = Message::new(DHT_APP_ID, MessageType::Rpc, Vec::new());
        // No websocket on either side and no signaling route: WebRTC cannot start.
        let result = manager.send(message, &target).await;
        assert!(result.is_err());
        assert!(!manager.has_connection(&target.peer_id).await);
        manager.stop().await.expect("stop");
    }
}
