//! Direct WebSocket links.
//!
//! [`WebSocketConnection`] adapts a `tokio-tungstenite` stream to the
//! [`ConnectionTransport`] seam: one binary frame per envelope, a reader task
//! that reports frames and closure through an [`EventSink`]. The reader is only
//! started once the owner has registered the transport, so no frame can reach
//! the event loop ahead of its registration.
//!
//! [`WebSocketServer`] accepts inbound links and [`WebSocketConnector`] dials
//! outbound ones. The connector also serves `requestConnection`, which lets a
//! peer that cannot be dialed ask a reachable peer to dial it instead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::connection::{
    ConnectionEvent, ConnectionId, ConnectionTransport, ConnectionType, EventSink, TransportEvent,
};
use crate::connection_manager::ConnectionManager;
use crate::error::{DhtError, Result};
use crate::identity::{ConnectivityMethod, PeerDescriptor};
use crate::protocol::{
    WebSocketConnectionRequest, WebSocketConnectionResponse, WebSocketConnectorProtocol,
    WebSocketConnectorRequest,
};
use crate::rpc::{IncomingMessage, RpcCommunicator, RpcHandler, Transport};

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

pub type ClientConnection = WebSocketConnection<MaybeTlsStream<TcpStream>>;
pub type ServerConnection = WebSocketConnection<TcpStream>;

// ============================================================================
// Connection
// ============================================================================

pub struct WebSocketConnection<S> {
    sink: EventSink,
    kind: ConnectionType,
    remote: Option<SocketAddr>,
    writer: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    reader: std::sync::Mutex<Option<SplitStream<WebSocketStream<S>>>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(
        stream: WebSocketStream<S>,
        kind: ConnectionType,
        remote: Option<SocketAddr>,
        sink: EventSink,
    ) -> Arc<Self> {
        let (writer, reader) = stream.split();
        Arc::new(Self {
            sink,
            kind,
            remote,
            writer: Mutex::new(writer),
            reader: std::sync::Mutex::new(Some(reader)),
            reader_task: std::sync::Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Begin reporting inbound frames. Calling it twice is a no-op.
    pub fn start(&self) {
        let Some(mut reader) = self.reader.lock().ok().and_then(|mut guard| guard.take()) else {
            return;
        };
        let sink = self.sink.clone();
        let closed = self.closed.clone();
        let task = tokio::spawn(async move {
            let (code, reason) = loop {
                match reader.next().await {
                    Some(Ok(WsMessage::Binary(data))) => sink.emit(ConnectionEvent::Data(data)),
                    Some(Ok(WsMessage::Text(text))) => {
                        sink.emit(ConnectionEvent::Data(text.into_bytes()))
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (u16::from(CloseCode::Normal), String::new()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        sink.emit(ConnectionEvent::Error(err.to_string()));
                        break (ABNORMAL_CLOSURE, err.to_string());
                    }
                    None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
                }
            };
            if !closed.swap(true, Ordering::AcqRel) {
                sink.emit(ConnectionEvent::Disconnected { code, reason });
            }
        });
        if let Ok(mut slot) = self.reader_task.lock() {
            *slot = Some(task);
        }
    }
}

#[async_trait]
impl<S> ConnectionTransport for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn connection_id(&self) -> ConnectionId {
        self.sink.connection_id()
    }

    fn connection_type(&self) -> ConnectionType {
        self.kind
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DhtError::ConnectionFailed(format!(
                "websocket {} is closed",
                self.connection_id()
            )));
        }
        self.writer.lock().await.send(WsMessage::Binary(data)).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "closed".into(),
        };
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.send(WsMessage::Close(Some(frame))).await {
            trace!(connection = %self.connection_id(), "close frame not sent: {err}");
        }
        let _ = writer.close().await;
        drop(writer);
        if let Some(task) = self.reader_task.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
        self.sink.emit(ConnectionEvent::Disconnected {
            code: u16::from(CloseCode::Normal),
            reason: "closed locally".to_string(),
        });
    }
}

/// Dial `target`; the returned connection is not yet reading.
pub async fn connect(
    target: &ConnectivityMethod,
    events: mpsc::UnboundedSender<TransportEvent>,
    timeout: Duration,
) -> Result<Arc<ClientConnection>> {
    let url = target.url();
    let (stream, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| DhtError::ConnectionFailed(format!("connecting to {url} timed out")))??;
    let remote = match stream.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        _ => None,
    };
    trace!(%url, "websocket connected");
    Ok(WebSocketConnection::new(
        stream,
        ConnectionType::WebSocketClient,
        remote,
        EventSink::new(events),
    ))
}

// ============================================================================
// Server
// ============================================================================

/// Listens for inbound WebSocket links and hands each one over unstarted.
pub struct WebSocketServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl WebSocketServer {
    /// Bind `host:port`; port 0 picks an ephemeral port.
    pub async fn bind(
        host: &str,
        port: u16,
        events: mpsc::UnboundedSender<TransportEvent>,
        accepted: mpsc::UnboundedSender<Arc<ServerConnection>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "websocket server listening");

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                let events = events.clone();
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => {
                            let connection = WebSocketConnection::new(
                                ws,
                                ConnectionType::WebSocketServer,
                                Some(remote),
                                EventSink::new(events),
                            );
                            let _ = accepted.send(connection);
                        }
                        Err(err) => debug!(%remote, "websocket upgrade failed: {err}"),
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Dials WebSocket peers and runs the reverse-connection RPC.
pub struct WebSocketConnector {
    manager: Weak<ConnectionManager>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connect_timeout: Duration,
    rpc: RwLock<Option<Arc<RpcCommunicator<WebSocketConnectorProtocol>>>>,
    inbox: RwLock<Option<mpsc::UnboundedSender<IncomingMessage>>>,
}

impl WebSocketConnector {
    pub fn new(
        manager: Weak<ConnectionManager>,
        events: mpsc::UnboundedSender<TransportEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            events,
            connect_timeout,
            rpc: RwLock::new(None),
            inbox: RwLock::new(None),
        }
    }

    pub async fn connect(&self, target: &ConnectivityMethod) -> Result<Arc<ClientConnection>> {
        connect(target, self.events.clone(), self.connect_timeout).await
    }

    /// Bind the RPC endpoint to the local descriptor and a signaling transport.
    pub async fn enable(&self, local: PeerDescriptor, signaling: Arc<dyn Transport>, rpc_timeout: Duration) {
        let rpc = Arc::new(RpcCommunicator::new(local, signaling, rpc_timeout));
        rpc.register_handler(Arc::new(ReverseConnectionHandler {
            manager: self.manager.clone(),
        }))
        .await;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = rpc.listen(rx);
        *self.inbox.write().await = Some(tx);
        *self.rpc.write().await = Some(rpc);
    }

    /// Hand an inbound `websocket_connector` envelope to the RPC endpoint.
    pub async fn deliver(&self, incoming: IncomingMessage) {
        match self.inbox.read().await.as_ref() {
            Some(inbox) => {
                let _ = inbox.send(incoming);
            }
            None => trace!(peer = %incoming.sender, "websocket connector not enabled; dropping"),
        }
    }

    /// Ask `target` to dial us back at `own`.
    pub async fn request_connection(
        &self,
        local: &PeerDescriptor,
        target: &PeerDescriptor,
        own: &ConnectivityMethod,
    ) -> Result<()> {
        let rpc = self.rpc.read().await.clone().ok_or(DhtError::NotRunning)?;
        let request = WebSocketConnectorRequest::RequestConnection(WebSocketConnectionRequest {
            requester: local.clone(),
            target: target.clone(),
            ip: own.ip.clone(),
            port: own.port,
        });
        let response = rpc.request(target, request).await?;
        if response.accepted {
            Ok(())
        } else {
            Err(DhtError::WebSocketConnectionRequestRejected(
                response.reason.unwrap_or_else(|| format!("{target} declined")),
            ))
        }
    }

    pub async fn stop(&self) {
        self.inbox.write().await.take();
        if let Some(rpc) = self.rpc.write().await.take() {
            rpc.stop().await;
        }
    }
}

struct ReverseConnectionHandler {
    manager: Weak<ConnectionManager>,
}

#[async_trait]
impl RpcHandler<WebSocketConnectorProtocol> for ReverseConnectionHandler {
    async fn handle(
        &self,
        caller: PeerDescriptor,
        request: WebSocketConnectorRequest,
    ) -> Result<WebSocketConnectionResponse> {
        let WebSocketConnectorRequest::RequestConnection(request) = request;
        let Some(manager) = self.manager.upgrade() else {
            return Err(DhtError::NotRunning);
        };
        if let Err(reason) = manager.can_accept_connection_request(&request).await {
            debug!(peer = %caller, %reason, "rejecting reverse connection request");
            return Ok(WebSocketConnectionResponse {
                accepted: false,
                reason: Some(reason),
            });
        }
        let requester = request
            .requester
            .clone()
            .with_websocket(ConnectivityMethod::new(request.ip.clone(), request.port));
        tokio::spawn(async move {
            if let Err(err) = manager.connect_websocket(requester.clone()).await {
                debug!(peer = %requester, "reverse websocket connection failed: {err}");
            }
        });
        Ok(WebSocketConnectionResponse {
            accepted: true,
            reason: None,
        })
    }
}
