//! Greedy relaying of envelopes to peers without a direct connection.
//!
//! Each hop forwards a [`RouteMessageWrapper`] to the connected peers closest
//! to the destination, skipping everyone already on the route path. The
//! destination delivers the inner message once per nonce.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::connection_manager::ConnectionManager;
use crate::error::{DhtError, Result};
use crate::identity::{distance_cmp, xor_distance, PeerDescriptor};
use crate::protocol::{DhtProtocol, DhtRequest, DhtResponse, Message, RouteMessageWrapper};
use crate::rpc::{RpcCommunicator, Transport};

/// Next hops tried per relay before giving up.
pub const ROUTE_FANOUT: usize = 3;

const SEEN_NONCES: usize = 1024;

pub struct Router {
    local: PeerDescriptor,
    manager: Arc<ConnectionManager>,
    rpc: Arc<RpcCommunicator<DhtProtocol>>,
    seen: Mutex<LruCache<String, ()>>,
}

impl Router {
    pub fn new(
        local: PeerDescriptor,
        manager: Arc<ConnectionManager>,
        rpc: Arc<RpcCommunicator<DhtProtocol>>,
    ) -> Arc<Self> {
        let capacity = NonZeroUsize::new(SEEN_NONCES).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            local,
            manager,
            rpc,
            seen: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Send `message` towards `destination` through the overlay.
    pub async fn route(&self, destination: &PeerDescriptor, message: Message) -> Result<()> {
        if destination.peer_id == self.local.peer_id {
            return Err(DhtError::CannotConnectToSelf);
        }
        let wrapper = RouteMessageWrapper {
            source: self.local.clone(),
            destination: destination.clone(),
            nonce: Uuid::new_v4().to_string(),
            message,
            route_path: Vec::new(),
        };
        self.forward(wrapper).await
    }

    /// Serve an incoming `routeMessage`: deliver it here or relay it further.
    pub async fn handle_route(&self, wrapper: RouteMessageWrapper) -> Result<()> {
        if wrapper.destination.peer_id == self.local.peer_id {
            let fresh = self.seen.lock().await.put(wrapper.nonce.clone(), ()).is_none();
            if fresh {
                trace!(source = %wrapper.source, hops = wrapper.route_path.len(), "routed message arrived");
                self.manager
                    .deliver_routed(wrapper.source, wrapper.message)
                    .await;
            } else {
                trace!(nonce = %wrapper.nonce, "duplicate routed message");
            }
            return Ok(());
        }
        if wrapper.route_path.contains(&self.local.peer_id) {
            return Err(DhtError::CouldNotRoute(format!(
                "routing loop towards {}",
                wrapper.destination
            )));
        }
        self.forward(wrapper).await
    }

    async fn forward(&self, mut wrapper: RouteMessageWrapper) -> Result<()> {
        let hops = self.next_hops(&wrapper).await;
        if hops.is_empty() {
            return Err(DhtError::CouldNotRoute(format!(
                "no next hop towards {}",
                wrapper.destination
            )));
        }
        wrapper.route_path.push(self.local.peer_id);

        let mut last_error = String::new();
        for hop in hops {
            let request = DhtRequest::RouteMessage(wrapper.clone());
            match self.rpc.request(&hop, request).await {
                Ok(DhtResponse::RouteAck { error: None }) => {
                    trace!(hop = %hop, destination = %wrapper.destination, "routed message accepted");
                    return Ok(());
                }
                Ok(DhtResponse::RouteAck { error: Some(err) }) => last_error = err,
                Ok(other) => last_error = format!("unexpected response {other:?}"),
                Err(err) => last_error = err.to_string(),
            }
            debug!(hop = %hop, destination = %wrapper.destination, "relay failed: {last_error}");
        }
        Err(DhtError::CouldNotRoute(last_error))
    }

    /// Connected peers closest to the destination that the message has not
    /// visited yet; the destination itself sorts first when connected.
    async fn next_hops(&self, wrapper: &RouteMessageWrapper) -> Vec<PeerDescriptor> {
        let destination = wrapper.destination.peer_id;
        let mut peers: Vec<PeerDescriptor> = self
            .manager
            .connected_peers()
            .await
            .into_iter()
            .filter(|peer| {
                peer.peer_id != self.local.peer_id
                    && peer.peer_id != wrapper.source.peer_id
                    && !wrapper.route_path.contains(&peer.peer_id)
            })
            .collect();
        peers.sort_by(|a, b| {
            distance_cmp(
                &xor_distance(&a.peer_id, &destination),
                &xor_distance(&b.peer_id, &destination),
            )
        });
        peers.truncate(ROUTE_FANOUT);
        peers
    }
}

/// Signaling transport: direct when a connection is open, routed otherwise.
///
/// Holds weak references since the connectors it serves are owned by the
/// manager.
pub struct RoutedTransport {
    manager: Weak<ConnectionManager>,
    router: Weak<Router>,
}

impl RoutedTransport {
    pub fn new(manager: Weak<ConnectionManager>, router: Weak<Router>) -> Self {
        Self { manager, router }
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn send(&self, message: Message, target: &PeerDescriptor) -> Result<()> {
        let manager = self.manager.upgrade().ok_or(DhtError::NotRunning)?;
        if manager.has_open_connection(&target.peer_id).await {
            return manager.send(message, target).await;
        }
        let router = self.router.upgrade().ok_or(DhtError::NotRunning)?;
        router.route(target, message).await
    }
}
