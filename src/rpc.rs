//! Request/response correlation over an abstract message transport.
//!
//! An [`RpcCommunicator`] is bound to one [`RpcProtocol`]: a closed request
//! enum, a response type and the `app_id` that namespaces them on the wire.
//! Outgoing requests are parked in a pending map keyed by a fresh UUID until
//! the matching response arrives, the timeout fires or the communicator stops.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{DhtError, Result};
use crate::identity::PeerDescriptor;
use crate::protocol::{
    decode_body, encode_body, Message, MessageType, RpcErrorBody, RpcErrorKind, RpcHeader, RpcKind,
    RpcMessage,
};

/// Default time a request waits for its response.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Seams
// ============================================================================

/// Outbound half of whatever carries envelopes to peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, message: Message, target: &PeerDescriptor) -> Result<()>;
}

/// A message delivered to a subsystem together with the peer it came from.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub sender: PeerDescriptor,
    pub message: Message,
}

/// A closed set of request variants; each variant is one wire method.
pub trait RpcMethod: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static {
    /// Every method name the enum can produce.
    const METHODS: &'static [&'static str];

    fn method(&self) -> &'static str;
}

pub trait RpcProtocol: Send + Sync + 'static {
    const APP_ID: &'static str;
    type Request: RpcMethod;
    type Response: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static;
}

/// Serves incoming requests and notifications of protocol `P`.
#[async_trait]
pub trait RpcHandler<P: RpcProtocol>: Send + Sync + 'static {
    async fn handle(&self, caller: PeerDescriptor, request: P::Request) -> Result<P::Response>;
}

// ============================================================================
// Communicator
// ============================================================================

struct PendingRequest<R> {
    method: &'static str,
    created_at: Instant,
    reply: oneshot::Sender<Result<R>>,
}

pub struct RpcCommunicator<P: RpcProtocol> {
    local: PeerDescriptor,
    transport: Arc<dyn Transport>,
    handler: RwLock<Option<Arc<dyn RpcHandler<P>>>>,
    pending: Mutex<HashMap<String, PendingRequest<P::Response>>>,
    timeout: Duration,
    stopped: AtomicBool,
}

impl<P: RpcProtocol> RpcCommunicator<P> {
    pub fn new(local: PeerDescriptor, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            local,
            transport,
            handler: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            timeout,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    pub async fn register_handler(&self, handler: Arc<dyn RpcHandler<P>>) {
        *self.handler.write().await = Some(handler);
    }

    /// Send a request and wait for the correlated response.
    pub async fn request(&self, target: &PeerDescriptor, request: P::Request) -> Result<P::Response> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DhtError::NotRunning);
        }
        let method = request.method();
        let request_id = Uuid::new_v4().to_string();
        let envelope = self.envelope(
            RpcKind::Request,
            method,
            request_id.clone(),
            target,
            encode_body(&request)?,
            None,
        )?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id.clone(),
            PendingRequest {
                method,
                created_at: Instant::now(),
                reply: tx,
            },
        );

        if let Err(err) = self.transport.send(envelope, target).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DhtError::NotRunning),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                debug!(method, peer = %target, "rpc request timed out");
                Err(DhtError::RpcTimeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Fire-and-forget; no response is expected. A no-op once stopped.
    pub async fn notify(&self, target: &PeerDescriptor, notification: P::Request) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        let envelope = self.envelope(
            RpcKind::Notification,
            notification.method(),
            Uuid::new_v4().to_string(),
            target,
            encode_body(&notification)?,
            None,
        )?;
        self.transport.send(envelope, target).await
    }

    /// Feed one envelope addressed to this protocol.
    ///
    /// Responses and notifications are handled before this returns, so
    /// notifications from one sender are processed in arrival order. Requests
    /// are served on their own task.
    pub async fn on_incoming_message(self: &Arc<Self>, sender: PeerDescriptor, message: Message) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let rpc: RpcMessage = match message.body_as() {
            Ok(rpc) => rpc,
            Err(err) => {
                warn!(peer = %sender, app_id = %message.app_id, "dropping undecodable rpc message: {err}");
                return;
            }
        };
        trace!(peer = %sender, method = %rpc.header.method, kind = ?rpc.header.kind, "rpc message");
        match rpc.header.kind {
            RpcKind::Response => self.on_response(rpc).await,
            RpcKind::Notification => {
                if let Err(err) = self.dispatch(&rpc).await {
                    debug!(peer = %rpc.source, method = %rpc.header.method, "notification failed: {err}");
                }
            }
            RpcKind::Request => {
                let this = self.clone();
                tokio::spawn(async move { this.on_request(rpc).await });
            }
        }
    }

    /// Pump envelopes from a subscription until the channel closes.
    pub fn listen(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<IncomingMessage>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(IncomingMessage { sender, message }) = incoming.recv().await {
                this.on_incoming_message(sender, message).await;
            }
        })
    }

    /// Drop the handler and every pending request. Waiting callers observe
    /// [`DhtError::NotRunning`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.handler.write().await = None;
        let mut pending = self.pending.lock().await;
        for (request_id, request) in pending.drain() {
            trace!(
                request_id = %request_id,
                method = request.method,
                age_ms = request.created_at.elapsed().as_millis() as u64,
                "abandoning pending request"
            );
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn on_response(&self, rpc: RpcMessage) {
        let Some(pending) = self.pending.lock().await.remove(&rpc.request_id) else {
            debug!(request_id = %rpc.request_id, "response without pending request");
            return;
        };
        let result = match rpc.error {
            Some(RpcErrorBody {
                kind: RpcErrorKind::UnknownMethod,
                message,
            }) => Err(DhtError::UnknownRpcMethod(message)),
            Some(RpcErrorBody { message, .. }) => Err(DhtError::RemoteError(message)),
            None => decode_body(&rpc.body).map_err(|err| {
                DhtError::Malformed(format!("{} response: {err}", pending.method))
            }),
        };
        let _ = pending.reply.send(result);
    }

    async fn on_request(&self, rpc: RpcMessage) {
        let (body, error) = match self.dispatch(&rpc).await {
            Ok(response) => match encode_body(&response) {
                Ok(body) => (body, None),
                Err(err) => (Vec::new(), Some(error_body(&err))),
            },
            Err(err) => {
                debug!(peer = %rpc.source, method = %rpc.header.method, "request failed: {err}");
                (Vec::new(), Some(error_body(&err)))
            }
        };
        let envelope = match self.envelope(
            RpcKind::Response,
            &rpc.header.method,
            rpc.request_id.clone(),
            &rpc.source,
            body,
            error,
        ) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("failed to encode response: {err}");
                return;
            }
        };
        if let Err(err) = self.transport.send(envelope, &rpc.source).await {
            debug!(peer = %rpc.source, method = %rpc.header.method, "failed to send response: {err}");
        }
    }

    async fn dispatch(&self, rpc: &RpcMessage) -> Result<P::Response> {
        let method = rpc.header.method.as_str();
        if !<P::Request as RpcMethod>::METHODS.contains(&method) {
            return Err(DhtError::UnknownRpcMethod(method.to_string()));
        }
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or_else(|| DhtError::UnknownRpcMethod(method.to_string()))?;
        let request: P::Request = decode_body(&rpc.body)
            .map_err(|err| DhtError::Malformed(format!("{method} request: {err}")))?;
        if request.method() != method {
            return Err(DhtError::Malformed(format!(
                "header names {method} but body is {}",
                request.method()
            )));
        }
        handler.handle(rpc.source.clone(), request).await
    }

    fn envelope(
        &self,
        kind: RpcKind,
        method: &str,
        request_id: String,
        target: &PeerDescriptor,
        body: Vec<u8>,
        error: Option<RpcErrorBody>,
    ) -> Result<Message> {
        let rpc = RpcMessage {
            header: RpcHeader {
                kind,
                method: method.to_string(),
            },
            request_id,
            source: self.local.clone(),
            target: target.clone(),
            body,
            error,
        };
        Ok(Message::new(P::APP_ID, MessageType::Rpc, encode_body(&rpc)?))
    }
}

fn error_body(err: &DhtError) -> RpcErrorBody {
    let kind = match err {
        DhtError::UnknownRpcMethod(_) => RpcErrorKind::UnknownMethod,
        DhtError::Malformed(_) => RpcErrorKind::Malformed,
        _ => RpcErrorKind::Handler,
    };
    RpcErrorBody {
        kind,
        message: err.to_string(),
    }
}
