//! [`DhtNetwork`] over the overlay's own RPC layer.
//!
//! Calls go through an [`RpcCommunicator`] bound to the `layer0` app id, which
//! hands envelopes to the connection manager. Connecting to a peer that is
//! not yet linked happens implicitly on the first request.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::core::DhtNetwork;
use crate::identity::{PeerDescriptor, PeerId};
use crate::protocol::{ClosestPeersRequest, DhtProtocol, DhtRequest, DhtResponse, PingRequest};
use crate::rpc::RpcCommunicator;

pub struct RpcDhtNetwork {
    rpc: Arc<RpcCommunicator<DhtProtocol>>,
}

impl RpcDhtNetwork {
    pub fn new(rpc: Arc<RpcCommunicator<DhtProtocol>>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl DhtNetwork for RpcDhtNetwork {
    async fn get_closest_peers(&self, to: &PeerDescriptor, target: PeerId) -> Result<Vec<PeerDescriptor>> {
        let request = DhtRequest::GetClosestPeers(ClosestPeersRequest {
            peer_id: target,
            requester: self.rpc.local_descriptor().clone(),
        });
        match self.rpc.request(to, request).await? {
            DhtResponse::ClosestPeers(peers) => Ok(peers),
            other => Err(anyhow!("unexpected getClosestPeers response from {to}: {other:?}")),
        }
    }

    async fn ping(&self, to: &PeerDescriptor) -> Result<()> {
        let nonce = Uuid::new_v4().to_string();
        let request = DhtRequest::Ping(PingRequest {
            nonce: nonce.clone(),
        });
        match self.rpc.request(to, request).await? {
            DhtResponse::Pong { nonce: echoed } if echoed == nonce => Ok(()),
            DhtResponse::Pong { .. } => Err(anyhow!("{to} answered ping with a foreign nonce")),
            other => Err(anyhow!("unexpected ping response from {to}: {other:?}")),
        }
    }
}
