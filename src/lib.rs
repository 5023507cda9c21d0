//! # overlay-dht
//!
//! A peer-to-peer overlay: a Kademlia-style DHT used for peer discovery and
//! message routing, layered on a connection manager that links peers either
//! directly over WebSocket or through NAT with WebRTC data channels. WebRTC
//! negotiation is signaled through the DHT's own RPC channel, so the only
//! fixed infrastructure is one reachable entry point.
//!
//! The crate is split into modules that can be used independently:
//!
//! - [`identity`]: peer ids, XOR distance and peer descriptors.
//! - [`contact_list`]: the distance-ordered list behind lookups and neighbors.
//! - [`core`]: the transport-agnostic Kademlia logic, including the routing
//!   table and the [`DhtNode`] join state machine.
//! - [`rpc`]: request/response correlation over any [`Transport`].
//! - [`connection`], [`websocket`], [`webrtc`]: connection handles and the
//!   transports that back them.
//! - [`connection_manager`]: the [`ConnectionManager`] owning every link.
//! - [`routing`], [`net`], [`server`]: the DHT RPC surface and its relaying.
//! - [`node`]: [`OverlayNode`], which wires all of the above for one peer.
//!
//! ## Getting started
//!
//! ```no_run
//! use overlay_dht::{ConnectivityMethod, NodeConfig, OverlayNode, PeerDescriptor, derive_peer_id};
//!
//! # async fn launch() -> overlay_dht::Result<()> {
//! let entry = PeerDescriptor::new(derive_peer_id("entrypoint"))
//!     .with_websocket(ConnectivityMethod::new("127.0.0.1", 23000));
//!
//! let mut config = NodeConfig::default();
//! config.peer_name = Some("peer-1".into());
//! config.connections.websocket_port = Some(0);
//! config.connections.entry_points = vec![entry];
//!
//! let node = OverlayNode::start(config).await?;
//! for neighbor in node.join_dht().await {
//!     println!("neighbor {neighbor}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` runs one such node from the command line.

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod contact_list;
pub mod core;
pub mod error;
pub mod identity;
pub mod net;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod rpc;
pub mod server;
pub mod webrtc;
pub mod websocket;

pub use config::{ConnectionManagerConfig, DhtConfig, NodeConfig, WebRtcConfig};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionType};
pub use connection_manager::ConnectionManager;
pub use contact_list::SortedContactList;
pub use core::{DhtNetwork, DhtNode, DhtPeer, RoutingTable};
pub use error::{DhtError, Result};
pub use identity::{derive_peer_id, ConnectivityMethod, NodeType, PeerDescriptor, PeerId};
pub use net::RpcDhtNetwork;
pub use node::OverlayNode;
pub use protocol::Message;
pub use rpc::{RpcCommunicator, Transport};
