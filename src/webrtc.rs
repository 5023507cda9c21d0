//! WebRTC data-channel links negotiated over the overlay itself.
//!
//! Offers, answers and ICE candidates travel as `webrtc_connector`
//! notifications through whatever signaling transport the node provides
//! (direct connections or routed DHT messages). Exactly one side of a pair
//! offers, decided by [`is_offering`]. The offerer mints the `connection_id`;
//! answers and candidates carrying another id are ignored.
//!
//! Candidates that arrive before the remote description are queued on the
//! session and applied once it is set. Local candidates are held back until
//! our own description has been sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::WebRtcConfig;
use crate::connection::{
    ConnectionEvent, ConnectionId, ConnectionTransport, ConnectionType, EventSink, TransportEvent,
};
use crate::connection_manager::ConnectionManager;
use crate::error::{DhtError, Result};
use crate::identity::{blake3_digest, PeerDescriptor, PeerId, PEER_ID_LEN};
use crate::protocol::{
    IceCandidate, RtcDescription, SignalAck, WebRtcConnectionRequest, WebRtcProtocol, WebRtcSignal,
};
use crate::rpc::{IncomingMessage, RpcCommunicator, RpcHandler, RpcMethod, Transport};

pub const DATA_CHANNEL_LABEL: &str = "dhtDataChannel";

/// Whether `local` creates the offer towards `remote`.
///
/// Both sides evaluate the same pair of digests with the roles swapped, so for
/// distinct ids exactly one of them offers.
pub fn is_offering(local: &PeerId, remote: &PeerId) -> bool {
    offering_hash(local, remote) < offering_hash(remote, local)
}

fn offering_hash(first: &PeerId, second: &PeerId) -> [u8; 32] {
    let mut pair = [0u8; 2 * PEER_ID_LEN];
    pair[..PEER_ID_LEN].copy_from_slice(first.as_bytes());
    pair[PEER_ID_LEN..].copy_from_slice(second.as_bytes());
    blake3_digest(&pair)
}

// ============================================================================
// Runtime
// ============================================================================

/// Owns the WebRTC API object and every peer connection created through it.
pub struct WebRtcRuntime {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    peer_connections: Mutex<Vec<Weak<RTCPeerConnection>>>,
    shut_down: AtomicBool,
}

impl WebRtcRuntime {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(config.include_loopback_candidates);

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        let ice_servers = config
            .stun_urls
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            ice_servers,
            peer_connections: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DhtError::NotRunning);
        }
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let mut tracked = self.peer_connections.lock().await;
        tracked.retain(|weak| weak.strong_count() > 0);
        tracked.push(Arc::downgrade(&pc));
        Ok(pc)
    }

    /// Close every live peer connection. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let tracked = std::mem::take(&mut *self.peer_connections.lock().await);
        for pc in tracked.iter().filter_map(Weak::upgrade) {
            if let Err(err) = pc.close().await {
                trace!("closing peer connection: {err}");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One open data channel. Messages above `max_message_size` are refused.
pub struct WebRtcConnection {
    sink: EventSink,
    channel: Arc<RTCDataChannel>,
    peer_connection: Arc<RTCPeerConnection>,
    max_message_size: usize,
    closed: Arc<AtomicBool>,
}

impl WebRtcConnection {
    fn new(
        sink: EventSink,
        channel: Arc<RTCDataChannel>,
        peer_connection: Arc<RTCPeerConnection>,
        max_message_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            channel,
            peer_connection,
            max_message_size,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Forward channel callbacks into the event sink. Handlers capture only
    /// the sink so the channel does not keep the transport alive.
    fn bind_channel_events(&self) {
        let sink = self.sink.clone();
        self.channel.on_open(Box::new(move || {
            Box::pin(async move {
                sink.emit(ConnectionEvent::Connected);
            })
        }));

        let sink = self.sink.clone();
        self.channel.on_message(Box::new(move |message: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(ConnectionEvent::Data(message.data.to_vec()));
            })
        }));

        let sink = self.sink.clone();
        let closed = self.closed.clone();
        self.channel.on_close(Box::new(move || {
            let sink = sink.clone();
            let closed = closed.clone();
            Box::pin(async move {
                if !closed.swap(true, Ordering::AcqRel) {
                    sink.emit(ConnectionEvent::Disconnected {
                        code: 1000,
                        reason: "data channel closed".to_string(),
                    });
                }
            })
        }));
    }
}

#[async_trait]
impl ConnectionTransport for WebRtcConnection {
    fn connection_id(&self) -> ConnectionId {
        self.sink.connection_id()
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::WebRtc
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DhtError::ConnectionFailed(format!(
                "data channel {} is closed",
                self.connection_id()
            )));
        }
        if data.len() > self.max_message_size {
            return Err(DhtError::ConnectionFailed(format!(
                "message of {} bytes exceeds the {} byte limit",
                data.len(),
                self.max_message_size
            )));
        }
        self.channel.send(&Bytes::from(data)).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.channel.close().await {
            trace!(connection = %self.connection_id(), "closing data channel: {err}");
        }
        if let Err(err) = self.peer_connection.close().await {
            trace!(connection = %self.connection_id(), "closing peer connection: {err}");
        }
        self.sink.emit(ConnectionEvent::Disconnected {
            code: 1000,
            reason: "closed locally".to_string(),
        });
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Negotiation state for one remote peer.
struct Session {
    token: ConnectionId,
    /// `None` while an answerer waits for the offer.
    connection_id: Option<String>,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    transport_id: Option<ConnectionId>,
    connected: bool,
    deadline: JoinHandle<()>,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    fn release(self) -> Option<Arc<RTCPeerConnection>> {
        self.deadline.abort();
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        self.peer_connection
    }
}

/// A registered offerer session whose offer is not out yet.
struct PreparedOffer {
    token: ConnectionId,
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
    ready: oneshot::Sender<()>,
}

#[derive(Clone)]
struct SignalingEndpoint {
    local: PeerDescriptor,
    rpc: Arc<RpcCommunicator<WebRtcProtocol>>,
}

pub struct WebRtcConnector {
    me: Weak<WebRtcConnector>,
    config: WebRtcConfig,
    runtime: WebRtcRuntime,
    manager: Weak<ConnectionManager>,
    events: mpsc::UnboundedSender<TransportEvent>,
    endpoint: RwLock<Option<SignalingEndpoint>>,
    inbox: RwLock<Option<mpsc::UnboundedSender<IncomingMessage>>>,
    sessions: Mutex<HashMap<PeerId, Session>>,
}

impl WebRtcConnector {
    pub fn new(
        config: WebRtcConfig,
        runtime: WebRtcRuntime,
        manager: Weak<ConnectionManager>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            runtime,
            manager,
            events,
            endpoint: RwLock::new(None),
            inbox: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn connecting_timeout(&self) -> tokio::time::Duration {
        self.config.connecting_timeout
    }

    /// Bind the signaling endpoint. Incoming signals are applied one at a
    /// time in arrival order; gathering and sending an offer or answer runs on
    /// its own task so one slow negotiation does not hold up the others.
    pub async fn enable(&self, local: PeerDescriptor, signaling: Arc<dyn Transport>, rpc_timeout: tokio::time::Duration) {
        let rpc = Arc::new(RpcCommunicator::new(local.clone(), signaling, rpc_timeout));
        rpc.register_handler(Arc::new(SignalHandler {
            connector: self.me.clone(),
        }))
        .await;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = rpc.listen(rx);
        *self.inbox.write().await = Some(tx);
        *self.endpoint.write().await = Some(SignalingEndpoint { local, rpc });
    }

    pub async fn deliver(&self, incoming: IncomingMessage) {
        match self.inbox.read().await.as_ref() {
            Some(inbox) => {
                let _ = inbox.send(incoming);
            }
            None => trace!(peer = %incoming.sender, "webrtc connector not enabled; dropping"),
        }
    }

    async fn endpoint(&self) -> Result<SignalingEndpoint> {
        self.endpoint.read().await.clone().ok_or(DhtError::NotRunning)
    }

    /// Start negotiating with `target`. Returns once the first signal is out;
    /// the manager learns about the link through the transport's events.
    pub async fn connect(&self, target: &PeerDescriptor) -> Result<()> {
        let endpoint = self.endpoint().await?;
        if target.peer_id == endpoint.local.peer_id {
            return Err(DhtError::CannotConnectToSelf);
        }
        if self.sessions.lock().await.contains_key(&target.peer_id) {
            trace!(peer = %target, "webrtc negotiation already in progress");
            return Ok(());
        }

        if is_offering(&endpoint.local.peer_id, &target.peer_id) {
            return self.start_offer(&endpoint, target.clone()).await;
        }

        let token = ConnectionId::new();
        let session = Session {
            token,
            connection_id: None,
            peer_connection: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            transport_id: None,
            connected: false,
            deadline: self.spawn_deadline(target.peer_id, token),
            forwarder: None,
        };
        self.sessions.lock().await.insert(target.peer_id, session);

        debug!(peer = %target, "requesting webrtc offer");
        let request = WebRtcSignal::RequestConnection(WebRtcConnectionRequest {
            requester: endpoint.local.clone(),
            target: target.clone(),
            connection_id: String::new(),
        });
        if let Err(err) = endpoint.rpc.notify(target, request).await {
            self.drop_session(&target.peer_id, token).await;
            return Err(err);
        }
        Ok(())
    }

    async fn start_offer(&self, endpoint: &SignalingEndpoint, remote: PeerDescriptor) -> Result<()> {
        let offer = self.prepare_offer(endpoint, &remote).await?;
        self.send_offer(endpoint, remote, offer).await
    }

    /// Create the peer connection and register its session.
    async fn prepare_offer(
        &self,
        endpoint: &SignalingEndpoint,
        remote: &PeerDescriptor,
    ) -> Result<PreparedOffer> {
        let token = ConnectionId::new();
        let connection_id = Uuid::new_v4().to_string();
        let pc = self.runtime.peer_connection().await?;
        let (ready, forwarder) = self.install_peer_callbacks(endpoint, remote, &connection_id, token, &pc);

        let previous = self.sessions.lock().await.insert(
            remote.peer_id,
            Session {
                token,
                connection_id: Some(connection_id.clone()),
                peer_connection: Some(pc.clone()),
                remote_description_set: false,
                pending_candidates: Vec::new(),
                transport_id: None,
                connected: false,
                deadline: self.spawn_deadline(remote.peer_id, token),
                forwarder: Some(forwarder),
            },
        );
        if let Some(pc) = previous.and_then(Session::release) {
            let _ = pc.close().await;
        }
        Ok(PreparedOffer {
            token,
            connection_id,
            pc,
            ready,
        })
    }

    /// Open the data channel, gather and send the offer.
    async fn send_offer(
        &self,
        endpoint: &SignalingEndpoint,
        remote: PeerDescriptor,
        offer: PreparedOffer,
    ) -> Result<()> {
        let PreparedOffer {
            token,
            connection_id,
            pc,
            ready,
        } = offer;
        let result = async {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
            self.adopt_channel(remote.clone(), token, pc.clone(), channel, endpoint.local.peer_id)
                .await;

            let offer = pc.create_offer(None).await?;
            let description = self.describe_local(&pc, offer).await?;
            debug!(peer = %remote, connection_id = %connection_id, "sending rtc offer");
            endpoint
                .rpc
                .notify(
                    &remote,
                    WebRtcSignal::RtcOffer(RtcDescription {
                        requester: endpoint.local.clone(),
                        target: remote.clone(),
                        description,
                        connection_id: connection_id.clone(),
                    }),
                )
                .await
        }
        .await;

        match result {
            Ok(()) => {
                let _ = ready.send(());
                Ok(())
            }
            Err(err) => {
                self.drop_session(&remote.peer_id, token).await;
                Err(err)
            }
        }
    }

    /// Wire ICE and state callbacks of a fresh peer connection. Local
    /// candidates queue up until the returned sender fires.
    fn install_peer_callbacks(
        &self,
        endpoint: &SignalingEndpoint,
        remote: &PeerDescriptor,
        connection_id: &str,
        token: ConnectionId,
        pc: &Arc<RTCPeerConnection>,
    ) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates_tx = candidates_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates_tx.send(init);
                    }
                    Err(err) => debug!("unserializable local candidate: {err}"),
                }
            })
        }));

        let connector = self.me.clone();
        let peer_id = remote.peer_id;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let connector = connector.clone();
            Box::pin(async move {
                trace!(peer = %peer_id.short(), ?state, "peer connection state");
                if matches!(state, RTCPeerConnectionState::Failed) {
                    if let Some(connector) = connector.upgrade() {
                        connector.fail_session(peer_id, token).await;
                    }
                }
            })
        }));

        let (ready_tx, ready_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_candidates(
            endpoint.rpc.clone(),
            endpoint.local.clone(),
            remote.clone(),
            connection_id.to_string(),
            ready_rx,
            candidates_rx,
        ));
        (ready_tx, forwarder)
    }

    /// Set the local description and wait for ICE gathering so the SDP
    /// already carries the host candidates.
    async fn describe_local(
        &self,
        pc: &RTCPeerConnection,
        description: RTCSessionDescription,
    ) -> Result<String> {
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(description).await?;
        let _ = tokio::time::timeout(self.config.connecting_timeout / 2, gathered.recv()).await;
        pc.local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| {
                DhtError::IllegalPeerConnectionState("no local description after gathering".into())
            })
    }

    /// Wrap a data channel and hand it to the manager before any of its
    /// events can fire.
    async fn adopt_channel(
        &self,
        remote: PeerDescriptor,
        token: ConnectionId,
        pc: Arc<RTCPeerConnection>,
        channel: Arc<RTCDataChannel>,
        initiator: PeerId,
    ) {
        let transport = WebRtcConnection::new(
            EventSink::new(self.events.clone()),
            channel,
            pc,
            self.config.max_message_size,
        );
        {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&remote.peer_id) {
                Some(session) if session.token == token => {
                    session.transport_id = Some(transport.connection_id());
                }
                _ => {
                    drop(sessions);
                    debug!(peer = %remote, "data channel for a stale session");
                    transport.close().await;
                    return;
                }
            }
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager
            .register_pending_transport(transport.clone(), remote, initiator)
            .await;
        transport.bind_channel_events();
    }

    fn spawn_deadline(&self, peer: PeerId, token: ConnectionId) -> JoinHandle<()> {
        let connector = self.me.clone();
        let timeout = self.config.connecting_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(connector) = connector.upgrade() {
                connector.expire_session(peer, token).await;
            }
        })
    }

    async fn expire_session(&self, peer: PeerId, token: ConnectionId) {
        let expired = {
            let mut sessions = self.sessions.lock().await;
            let pending = sessions
                .get(&peer)
                .is_some_and(|session| session.token == token && !session.connected);
            if pending {
                sessions.remove(&peer)
            } else {
                None
            }
        };
        if let Some(session) = expired {
            warn!(peer = %peer.short(), "webrtc connection not established in time");
            self.close_session(peer, session).await;
        }
    }

    async fn fail_session(&self, peer: PeerId, token: ConnectionId) {
        let failed = {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(&peer).is_some_and(|session| session.token == token) {
                sessions.remove(&peer)
            } else {
                None
            }
        };
        if let Some(session) = failed {
            debug!(peer = %peer.short(), "peer connection failed");
            self.close_session(peer, session).await;
        }
    }

    async fn drop_session(&self, peer: &PeerId, token: ConnectionId) {
        let dropped = {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(peer).is_some_and(|session| session.token == token) {
                sessions.remove(peer)
            } else {
                None
            }
        };
        if let Some(session) = dropped {
            if let Some(pc) = session.release() {
                let _ = pc.close().await;
            }
        }
    }

    async fn close_session(&self, peer: PeerId, session: Session) {
        if let Some(pc) = session.release() {
            let _ = pc.close().await;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.on_webrtc_failed(peer).await;
        }
    }

    /// Called by the manager once a data channel carried a handshake.
    pub async fn mark_connected(&self, peer: &PeerId, transport_id: ConnectionId) {
        if let Some(session) = self.sessions.lock().await.get_mut(peer) {
            if session.transport_id == Some(transport_id) {
                session.connected = true;
                session.deadline.abort();
            }
        }
    }

    /// Called by the manager when a transport to `peer` went away.
    pub async fn on_disconnected(&self, peer: &PeerId, transport_id: ConnectionId) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let owns = sessions
                .get(peer)
                .is_some_and(|session| session.transport_id == Some(transport_id));
            if owns {
                sessions.remove(peer)
            } else {
                None
            }
        };
        if let Some(session) = removed {
            trace!(peer = %peer.short(), "webrtc session ended");
            if let Some(pc) = session.release() {
                let _ = pc.close().await;
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn stop(&self) {
        self.inbox.write().await.take();
        if let Some(endpoint) = self.endpoint.write().await.take() {
            endpoint.rpc.stop().await;
        }
        let sessions: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Some(pc) = session.release() {
                let _ = pc.close().await;
            }
        }
        self.runtime.shutdown().await;
    }

    // ========================================================================
    // Incoming signals
    // ========================================================================

    async fn on_connection_request(&self, request: WebRtcConnectionRequest) -> Result<()> {
        let endpoint = self.endpoint().await?;
        if request.target.peer_id != endpoint.local.peer_id {
            return Ok(());
        }
        let remote = request.requester;
        if !is_offering(&endpoint.local.peer_id, &remote.peer_id) {
            warn!(peer = %remote, "connection request from a peer that should offer");
            return Ok(());
        }
        if self.sessions.lock().await.contains_key(&remote.peer_id) {
            return Ok(());
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.ensure_deferred(&remote).await;
        }
        let offer = self.prepare_offer(&endpoint, &remote).await?;
        let Some(connector) = self.me.upgrade() else {
            return Ok(());
        };
        tokio::spawn(async move {
            if let Err(err) = connector.send_offer(&endpoint, remote.clone(), offer).await {
                debug!(peer = %remote, "rtc offer failed: {err}");
            }
        });
        Ok(())
    }

    async fn on_offer(&self, offer: RtcDescription) -> Result<()> {
        let endpoint = self.endpoint().await?;
        if offer.target.peer_id != endpoint.local.peer_id {
            return Ok(());
        }
        let remote = offer.requester.clone();
        if let Some(manager) = self.manager.upgrade() {
            manager.ensure_deferred(&remote).await;
        }

        let (token, queued) = {
            let mut sessions = self.sessions.lock().await;
            match sessions.remove(&remote.peer_id) {
                Some(session) if session.connection_id.as_deref() == Some(offer.connection_id.as_str()) => {
                    trace!(peer = %remote, "duplicate offer");
                    sessions.insert(remote.peer_id, session);
                    return Ok(());
                }
                Some(session) if session.peer_connection.is_none() => {
                    let token = session.token;
                    let queued: Vec<IceCandidate> = session
                        .pending_candidates
                        .iter()
                        .filter(|c| c.connection_id == offer.connection_id)
                        .cloned()
                        .collect();
                    let _ = session.release();
                    (token, queued)
                }
                Some(stale) => {
                    debug!(peer = %remote, "replacing session for a new offer");
                    if let Some(pc) = stale.release() {
                        let _ = pc.close().await;
                    }
                    (ConnectionId::new(), Vec::new())
                }
                None => (ConnectionId::new(), Vec::new()),
            }
        };

        let pc = self.runtime.peer_connection().await?;
        let (ready, forwarder) =
            self.install_peer_callbacks(&endpoint, &remote, &offer.connection_id, token, &pc);

        let connector = self.me.clone();
        let channel_owner = remote.clone();
        let channel_pc = Arc::downgrade(&pc);
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let connector = connector.clone();
            let remote = channel_owner.clone();
            let pc = channel_pc.clone();
            Box::pin(async move {
                if channel.label() != DATA_CHANNEL_LABEL {
                    debug!(label = channel.label(), "ignoring unexpected data channel");
                    return;
                }
                if let (Some(connector), Some(pc)) = (connector.upgrade(), pc.upgrade()) {
                    let initiator = remote.peer_id;
                    connector.adopt_channel(remote, token, pc, channel, initiator).await;
                }
            })
        }));

        self.sessions.lock().await.insert(
            remote.peer_id,
            Session {
                token,
                connection_id: Some(offer.connection_id.clone()),
                peer_connection: Some(pc.clone()),
                remote_description_set: false,
                pending_candidates: Vec::new(),
                transport_id: None,
                connected: false,
                deadline: self.spawn_deadline(remote.peer_id, token),
                forwarder: Some(forwarder),
            },
        );

        let applied = async {
            pc.set_remote_description(RTCSessionDescription::offer(offer.description.clone())?)
                .await?;
            self.remote_description_applied(&remote.peer_id, token, &pc, queued)
                .await;
            Ok::<(), DhtError>(())
        }
        .await;
        if let Err(err) = applied {
            self.fail_session(remote.peer_id, token).await;
            return Err(err);
        }

        let Some(connector) = self.me.upgrade() else {
            return Ok(());
        };
        tokio::spawn(async move {
            let remote_id = remote.peer_id;
            if let Err(err) = connector
                .send_answer(&endpoint, remote, offer.connection_id, token, pc, ready)
                .await
            {
                debug!(peer = %remote_id.short(), "rtc answer failed: {err}");
            }
        });
        Ok(())
    }

    async fn send_answer(
        &self,
        endpoint: &SignalingEndpoint,
        remote: PeerDescriptor,
        connection_id: String,
        token: ConnectionId,
        pc: Arc<RTCPeerConnection>,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        let result = async {
            let answer = pc.create_answer(None).await?;
            let description = self.describe_local(&pc, answer).await?;
            debug!(peer = %remote, connection_id = %connection_id, "sending rtc answer");
            endpoint
                .rpc
                .notify(
                    &remote,
                    WebRtcSignal::RtcAnswer(RtcDescription {
                        requester: endpoint.local.clone(),
                        target: remote.clone(),
                        description,
                        connection_id: connection_id.clone(),
                    }),
                )
                .await
        }
        .await;

        match result {
            Ok(()) => {
                let _ = ready.send(());
                Ok(())
            }
            Err(err) => {
                self.fail_session(remote.peer_id, token).await;
                Err(err)
            }
        }
    }

    async fn on_answer(&self, answer: RtcDescription) -> Result<()> {
        let endpoint = self.endpoint().await?;
        if answer.target.peer_id != endpoint.local.peer_id {
            return Ok(());
        }
        let remote = answer.requester.peer_id;
        let (pc, token) = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&remote) {
                Some(session) if session.connection_id.as_deref() == Some(answer.connection_id.as_str()) => {
                    match &session.peer_connection {
                        Some(pc) => (pc.clone(), session.token),
                        None => return Ok(()),
                    }
                }
                _ => {
                    trace!(peer = %remote.short(), "ignoring answer with mismatched connection id");
                    return Ok(());
                }
            }
        };
        pc.set_remote_description(RTCSessionDescription::answer(answer.description)?)
            .await?;
        self.remote_description_applied(&remote, token, &pc, Vec::new())
            .await;
        Ok(())
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let endpoint = self.endpoint().await?;
        if candidate.target.peer_id != endpoint.local.peer_id {
            return Ok(());
        }
        let remote = candidate.requester.peer_id;
        let pc = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&remote) else {
                return Ok(());
            };
            match session.connection_id.as_deref() {
                None => {
                    session.pending_candidates.push(candidate);
                    return Ok(());
                }
                Some(id) if id != candidate.connection_id => {
                    trace!(peer = %remote.short(), "ignoring candidate with mismatched connection id");
                    return Ok(());
                }
                Some(_) if !session.remote_description_set => {
                    session.pending_candidates.push(candidate);
                    return Ok(());
                }
                Some(_) => match &session.peer_connection {
                    Some(pc) => pc.clone(),
                    None => return Ok(()),
                },
            }
        };
        pc.add_ice_candidate(candidate_init(candidate)).await?;
        Ok(())
    }

    /// Flag the remote description as set and apply everything queued so far.
    async fn remote_description_applied(
        &self,
        peer: &PeerId,
        token: ConnectionId,
        pc: &RTCPeerConnection,
        mut queued: Vec<IceCandidate>,
    ) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(peer).filter(|s| s.token == token) {
                session.remote_description_set = true;
                queued.append(&mut session.pending_candidates);
            }
        }
        for candidate in queued {
            if let Err(err) = pc.add_ice_candidate(candidate_init(candidate)).await {
                debug!(peer = %peer.short(), "queued candidate rejected: {err}");
            }
        }
    }
}

fn candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.mid,
        sdp_mline_index: candidate.mline_index,
        username_fragment: None,
    }
}

async fn forward_candidates(
    rpc: Arc<RpcCommunicator<WebRtcProtocol>>,
    local: PeerDescriptor,
    remote: PeerDescriptor,
    connection_id: String,
    ready: oneshot::Receiver<()>,
    mut candidates: mpsc::UnboundedReceiver<RTCIceCandidateInit>,
) {
    if ready.await.is_err() {
        return;
    }
    while let Some(init) = candidates.recv().await {
        let signal = WebRtcSignal::IceCandidate(IceCandidate {
            requester: local.clone(),
            target: remote.clone(),
            candidate: init.candidate,
            mid: init.sdp_mid,
            mline_index: init.sdp_mline_index,
            connection_id: connection_id.clone(),
        });
        if let Err(err) = rpc.notify(&remote, signal).await {
            debug!(peer = %remote, "failed to send ice candidate: {err}");
        }
    }
}

struct SignalHandler {
    connector: Weak<WebRtcConnector>,
}

#[async_trait]
impl RpcHandler<WebRtcProtocol> for SignalHandler {
    async fn handle(&self, caller: PeerDescriptor, signal: WebRtcSignal) -> Result<SignalAck> {
        let connector = self.connector.upgrade().ok_or(DhtError::NotRunning)?;
        trace!(peer = %caller, method = signal.method(), "webrtc signal");
        let result = match signal {
            WebRtcSignal::RequestConnection(request) => connector.on_connection_request(request).await,
            WebRtcSignal::RtcOffer(offer) => connector.on_offer(offer).await,
            WebRtcSignal::RtcAnswer(answer) => connector.on_answer(answer).await,
            WebRtcSignal::IceCandidate(candidate) => connector.on_remote_candidate(candidate).await,
        };
        if let Err(err) = &result {
            info!(peer = %caller, "webrtc signal failed: {err}");
        }
        result.map(|()| SignalAck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_peer_id;

    #[test]
    fn exactly_one_side_offers() {
        for i in 0..64 {
            let a = derive_peer_id(&format!("peer-a-{i}"));
            let b = derive_peer_id(&format!("peer-b-{i}"));
            assert_ne!(
                is_offering(&a, &b),
                is_offering(&b, &a),
                "pair {i} must have exactly one offerer"
            );
        }
    }

    #[test]
    fn nobody_offers_to_itself() {
        let a = derive_peer_id("lonely");
        assert!(!is_offering(&a, &a));
    }

    #[test]
    fn candidate_fields_carry_over() {
        let peer = PeerDescriptor::new(derive_peer_id("remote"));
        let init = candidate_init(IceCandidate {
            requester: peer.clone(),
            target: peer,
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".to_string(),
            mid: Some("0".to_string()),
            mline_index: Some(0),
            connection_id: "c".to_string(),
        });
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.candidate.ends_with("typ host"));
    }

    struct Swallow;

    #[async_trait]
    impl Transport for Swallow {
        async fn send(&self, _message: crate::protocol::Message, _target: &PeerDescriptor) -> Result<()> {
            Ok(())
        }
    }

    /// An enabled connector that offers towards the returned remote.
    async fn offering_connector() -> (Arc<WebRtcConnector>, PeerDescriptor, PeerDescriptor) {
        let mut local = PeerDescriptor::new(derive_peer_id("offerer"));
        let mut remote = PeerDescriptor::new(derive_peer_id("answerer"));
        if !is_offering(&local.peer_id, &remote.peer_id) {
            std::mem::swap(&mut local, &mut remote);
        }
        let config = WebRtcConfig::default();
        let runtime = WebRtcRuntime::new(&config).expect("runtime");
        let (events, _) = mpsc::unbounded_channel();
        let connector = WebRtcConnector::new(config, runtime, Weak::new(), events);
        connector
            .enable(local.clone(), Arc::new(Swallow), tokio::time::Duration::from_secs(1))
            .await;
        (connector, local, remote)
    }

    #[tokio::test]
    async fn signals_for_another_connection_id_leave_the_session_alone() {
        let (connector, local, remote) = offering_connector().await;
        connector.connect(&remote).await.expect("offer sent");
        let connection_id = connector.sessions.lock().await[&remote.peer_id]
            .connection_id
            .clone()
            .expect("offerer picks the connection id");

        connector
            .on_answer(RtcDescription {
                requester: remote.clone(),
                target: local.clone(),
                description: "v=0".to_string(),
                connection_id: "someone-else".to_string(),
            })
            .await
            .expect("foreign answers are ignored");
        let candidate = |connection_id: &str| IceCandidate {
            requester: remote.clone(),
            target: local.clone(),
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".to_string(),
            mid: Some("0".to_string()),
            mline_index: Some(0),
            connection_id: connection_id.to_string(),
        };
        connector
            .on_remote_candidate(candidate("someone-else"))
            .await
            .expect("foreign candidates are ignored");

        {
            let sessions = connector.sessions.lock().await;
            let session = &sessions[&remote.peer_id];
            assert_eq!(session.connection_id.as_deref(), Some(connection_id.as_str()));
            assert!(!session.remote_description_set);
            assert!(session.pending_candidates.is_empty());
        }

        connector
            .on_remote_candidate(candidate(&connection_id))
            .await
            .expect("matching candidate");
        assert_eq!(
            connector.sessions.lock().await[&remote.peer_id].pending_candidates.len(),
            1,
            "a matching candidate waits for the answer"
        );
        connector.stop().await;
    }

    #[tokio::test]
    async fn runtime_refuses_peer_connections_after_shutdown() {
        let runtime = WebRtcRuntime::new(&WebRtcConfig::default()).expect("runtime");
        let pc = runtime.peer_connection().await.expect("peer connection");
        runtime.shutdown().await;
        runtime.shutdown().await;
        assert!(runtime.is_shut_down());
        assert!(runtime.peer_connection().await.is_err());
        drop(pc);
    }
}
