use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::core::{DhtNetwork, DhtNode};
use crate::error::Result;
use crate::identity::PeerDescriptor;
use crate::protocol::{DhtProtocol, DhtRequest, DhtResponse};
use crate::routing::Router;
use crate::rpc::RpcHandler;

/// Serves the `layer0` surface: `getClosestPeers`, `ping` and `routeMessage`.
///
/// Register it on the DHT [`crate::rpc::RpcCommunicator`]; stopping the
/// communicator drops the handler and with it the references below.
pub struct DhtRpcHandler<N: DhtNetwork> {
    node: Arc<DhtNode<N>>,
    router: Arc<Router>,
}

impl<N: DhtNetwork> DhtRpcHandler<N> {
    pub fn new(node: Arc<DhtNode<N>>, router: Arc<Router>) -> Self {
        Self { node, router }
    }
}

impl<N: DhtNetwork> fmt::Debug for DhtRpcHandler<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtRpcHandler")
            .field("peer", &self.node.peer_id())
            .finish()
    }
}

#[async_trait]
impl<N: DhtNetwork> RpcHandler<DhtProtocol> for DhtRpcHandler<N> {
    async fn handle(&self, caller: PeerDescriptor, request: DhtRequest) -> Result<DhtResponse> {
        Ok(match request {
            DhtRequest::GetClosestPeers(request) => {
                let peers = self
                    .node
                    .handle_get_closest_peers(&caller, request.peer_id)
                    .await;
                DhtResponse::ClosestPeers(peers)
            }
            DhtRequest::Ping(ping) => DhtResponse::Pong {
                nonce: self.node.handle_ping(&caller, ping.nonce).await,
            },
            DhtRequest::RouteMessage(wrapper) => match self.router.handle_route(wrapper).await {
                Ok(()) => DhtResponse::RouteAck { error: None },
                Err(err) => {
                    debug!(caller = %caller, "route request failed: {err}");
                    DhtResponse::RouteAck {
                        error: Some(err.to_string()),
                    }
                }
            },
        })
    }
}
