//! Composition root for one overlay peer.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::connection_manager::ConnectionManager;
use crate::core::DhtNode;
use crate::error::Result;
use crate::identity::{derive_peer_id, PeerDescriptor, PeerId};
use crate::net::RpcDhtNetwork;
use crate::protocol::{DhtProtocol, Message, DHT_APP_ID};
use crate::routing::{RoutedTransport, Router};
use crate::rpc::{IncomingMessage, RpcCommunicator, Transport};
use crate::server::DhtRpcHandler;

/// A started peer: connection manager, DHT RPC surface, router and the
/// Kademlia node, wired together.
///
/// ```no_run
/// use overlay_dht::{NodeConfig, OverlayNode};
///
/// # async fn launch(config: NodeConfig) -> overlay_dht::Result<()> {
/// let node = OverlayNode::start(config).await?;
/// let neighbors = node.join_dht().await;
/// println!("{} neighbors", neighbors.len());
/// node.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct OverlayNode {
    local: PeerDescriptor,
    config: NodeConfig,
    manager: Arc<ConnectionManager>,
    rpc: Arc<RpcCommunicator<DhtProtocol>>,
    router: Arc<Router>,
    dht: Arc<DhtNode<RpcDhtNetwork>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl OverlayNode {
    /// Start the connection manager, settle the local descriptor from the
    /// connectivity probe and bring up the DHT RPC surface.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let manager = ConnectionManager::new(config.connections.clone())?;
        let connectivity = manager.start().await?;

        let peer_id = config
            .peer_name
            .as_deref()
            .map(derive_peer_id)
            .unwrap_or_else(PeerId::random);
        let mut local = PeerDescriptor::new(peer_id);
        local.node_type = config.node_type;
        local.region = config.region;
        if connectivity.open_internet {
            local.websocket = connectivity.websocket.clone();
        }

        let transport: Arc<dyn Transport> = manager.clone();
        let rpc = Arc::new(RpcCommunicator::new(local.clone(), transport, config.rpc_timeout));
        let router = Router::new(local.clone(), manager.clone(), rpc.clone());
        let dht = Arc::new(DhtNode::new(
            local.clone(),
            RpcDhtNetwork::new(rpc.clone()),
            config.dht.clone(),
        ));
        rpc.register_handler(Arc::new(DhtRpcHandler::new(dht.clone(), router.clone())))
            .await;
        let listener = rpc.listen(manager.subscribe(DHT_APP_ID).await);

        let signaling = Arc::new(RoutedTransport::new(
            Arc::downgrade(&manager),
            Arc::downgrade(&router),
        ));
        manager
            .enable_connectivity(local.clone(), signaling, config.rpc_timeout)
            .await;

        info!(
            peer = %local,
            open_internet = connectivity.open_internet,
            nat_type = ?connectivity.nat_type,
            "overlay node started"
        );
        Ok(Arc::new(Self {
            local,
            config,
            manager,
            rpc,
            router,
            dht,
            listener: Mutex::new(Some(listener)),
        }))
    }

    /// Join through the configured entry points.
    pub async fn join_dht(&self) -> Vec<PeerDescriptor> {
        let entry_points = self.config.connections.entry_points.clone();
        self.join_dht_via(&entry_points).await
    }

    pub async fn join_dht_via(&self, entry_points: &[PeerDescriptor]) -> Vec<PeerDescriptor> {
        let others: Vec<PeerDescriptor> = entry_points
            .iter()
            .filter(|entry| entry.peer_id != self.local.peer_id)
            .cloned()
            .collect();
        self.dht.join_dht(&others).await
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    pub fn dht(&self) -> &Arc<DhtNode<RpcDhtNetwork>> {
        &self.dht
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn rpc(&self) -> &Arc<RpcCommunicator<DhtProtocol>> {
        &self.rpc
    }

    pub async fn neighbors(&self) -> Vec<PeerDescriptor> {
        self.dht.neighbors().await
    }

    /// Send directly, opening a connection when needed.
    pub async fn send(&self, message: Message, target: &PeerDescriptor) -> Result<()> {
        self.manager.send(message, target).await
    }

    /// Relay through the overlay without opening a connection to `target`.
    pub async fn route(&self, message: Message, target: &PeerDescriptor) -> Result<()> {
        self.router.route(target, message).await
    }

    pub async fn subscribe(&self, app_id: &str) -> tokio::sync::mpsc::UnboundedReceiver<IncomingMessage> {
        self.manager.subscribe(app_id).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.rpc.stop().await;
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.manager.stop().await?;
        info!(peer = %self.local, "overlay node stopped");
        Ok(())
    }
}
