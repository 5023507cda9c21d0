#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{timeout, Duration};

use overlay_dht::rpc::IncomingMessage;
use overlay_dht::{DhtConfig, DhtNetwork, DhtNode, NodeConfig, OverlayNode, PeerDescriptor, PeerId};

/// In-memory [`DhtNetwork`] that calls straight into registered nodes.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    local: PeerDescriptor,
    failures: Arc<Mutex<HashSet<PeerId>>>,
    lookups: Arc<Mutex<Vec<PeerId>>>,
    pings: Arc<Mutex<Vec<PeerId>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, local: PeerDescriptor) -> Self {
        Self {
            registry,
            local,
            failures: Arc::new(Mutex::new(HashSet::new())),
            lookups: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_failure(&self, peer: PeerId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(peer);
        } else {
            failures.remove(&peer);
        }
    }

    pub async fn lookup_calls(&self) -> Vec<PeerId> {
        self.lookups.lock().await.clone()
    }

    pub async fn ping_calls(&self) -> Vec<PeerId> {
        self.pings.lock().await.clone()
    }

    async fn should_fail(&self, peer: &PeerId) -> bool {
        self.failures.lock().await.contains(peer)
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<PeerId, Arc<DhtNode<TestNetwork>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: Arc<DhtNode<TestNetwork>>) {
        self.peers.write().await.insert(node.peer_id(), node);
    }

    pub async fn get(&self, id: &PeerId) -> Option<Arc<DhtNode<TestNetwork>>> {
        self.peers.read().await.get(id).cloned()
    }
}

#[async_trait]
impl DhtNetwork for TestNetwork {
    async fn get_closest_peers(&self, to: &PeerDescriptor, target: PeerId) -> Result<Vec<PeerDescriptor>> {
        self.lookups.lock().await.push(to.peer_id);
        if self.should_fail(&to.peer_id).await {
            return Err(anyhow!("injected network failure"));
        }
        match self.registry.get(&to.peer_id).await {
            Some(peer) => Ok(peer.handle_get_closest_peers(&self.local, target).await),
            None => Err(anyhow!("peer not reachable")),
        }
    }

    async fn ping(&self, to: &PeerDescriptor) -> Result<()> {
        self.pings.lock().await.push(to.peer_id);
        if self.should_fail(&to.peer_id).await {
            return Err(anyhow!("injected network failure"));
        }
        match self.registry.get(&to.peer_id).await {
            Some(peer) => {
                peer.handle_ping(&self.local, "ping".to_string()).await;
                Ok(())
            }
            None => Err(anyhow!("peer not reachable")),
        }
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode<TestNetwork>>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize, alpha: usize) -> Self {
        let descriptor = make_descriptor(index);
        let network = TestNetwork::new(registry.clone(), descriptor.clone());
        let config = DhtConfig {
            k,
            alpha,
            neighbor_list_size: k,
        };
        let node = Arc::new(DhtNode::new(descriptor, network.clone(), config));
        registry.register(node.clone()).await;
        Self { node, network }
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        self.node.local_descriptor().clone()
    }
}

pub fn make_peer_id(index: u32) -> PeerId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    PeerId::from_bytes(id)
}

pub fn make_descriptor(index: u32) -> PeerDescriptor {
    PeerDescriptor::new(make_peer_id(index))
}

// ============================================================================
// Socket-level helpers
// ============================================================================

/// Start an overlay node on loopback. `port: None` runs without a WebSocket
/// server, which makes the node unreachable for direct dials.
pub async fn start_node(
    name: &str,
    port: Option<u16>,
    entry_point: Option<&PeerDescriptor>,
) -> Arc<OverlayNode> {
    let mut config = NodeConfig::default();
    config.peer_name = Some(name.to_string());
    config.connections.websocket_port = port;
    config.connections.connect_timeout = Duration::from_secs(5);
    config.connections.webrtc.include_loopback_candidates = true;
    config.connections.webrtc.connecting_timeout = Duration::from_secs(15);
    config.rpc_timeout = Duration::from_secs(5);
    if let Some(entry) = entry_point {
        config.connections.entry_points = vec![entry.clone()];
    }
    OverlayNode::start(config).await.expect("node starts")
}

pub async fn recv_within(
    inbox: &mut mpsc::UnboundedReceiver<IncomingMessage>,
    limit: Duration,
) -> IncomingMessage {
    timeout(limit, inbox.recv())
        .await
        .expect("message arrives in time")
        .expect("inbox open")
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
