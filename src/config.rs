//! Option structs for every layer of a node.
//!
//! All of them implement `Default` with the values a single overlay node runs
//! with, and round-trip through JSON with durations written as milliseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::Result;
use crate::identity::{NodeType, PeerDescriptor};
use crate::rpc::DEFAULT_RPC_TIMEOUT;

/// Default bucket size and lookup termination threshold.
pub const DEFAULT_K: usize = 8;
/// Default lookup parallelism.
pub const DEFAULT_ALPHA: usize = 3;
/// Largest envelope a data channel accepts.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    /// Capacity of the long-lived neighbor list.
    pub neighbor_list_size: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            neighbor_list_size: DEFAULT_K,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_urls: Vec<String>,
    #[serde(with = "duration_ms")]
    pub connecting_timeout: Duration,
    pub max_message_size: usize,
    /// Offer 127.0.0.1 candidates; needed when peers share a host without
    /// another interface.
    pub include_loopback_candidates: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_urls: Vec::new(),
            connecting_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            include_loopback_candidates: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionManagerConfig {
    pub websocket_host: String,
    /// `None` disables the WebSocket server; `Some(0)` binds an ephemeral port.
    pub websocket_port: Option<u16>,
    pub entry_points: Vec<PeerDescriptor>,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Grace period of a scheduled disconnect.
    #[serde(with = "duration_ms")]
    pub disconnection_timeout: Duration,
    /// Budget for dialing back a peer that asked for a connectivity probe.
    #[serde(with = "duration_ms")]
    pub connectivity_timeout: Duration,
    pub webrtc: WebRtcConfig,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            websocket_host: "127.0.0.1".to_string(),
            websocket_port: None,
            entry_points: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            disconnection_timeout: Duration::from_millis(10_000),
            connectivity_timeout: Duration::from_millis(1_000),
            webrtc: WebRtcConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Derives the peer id when set; otherwise the id is random.
    pub peer_name: Option<String>,
    pub node_type: NodeType,
    pub region: Option<u32>,
    pub dht: DhtConfig,
    pub connections: ConnectionManagerConfig,
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_name: None,
            node_type: NodeType::default(),
            region: None,
            dht: DhtConfig::default(),
            connections: ConnectionManagerConfig::default(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl NodeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.dht.k, 8);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.connections.disconnection_timeout, Duration::from_millis(10_000));
        assert_eq!(config.connections.webrtc.max_message_size, 1_048_576);
        assert!(config.connections.websocket_port.is_none());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"peer_name": "entrypoint", "connections": {"websocket_port": 0, "connect_timeout": 2500}}"#,
        )
        .expect("parse config");
        assert_eq!(config.peer_name.as_deref(), Some("entrypoint"));
        assert_eq!(config.connections.websocket_port, Some(0));
        assert_eq!(config.connections.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.connections.websocket_host, "127.0.0.1");
        assert_eq!(config.dht.k, DEFAULT_K);
        assert_eq!(config.rpc_timeout, DEFAULT_RPC_TIMEOUT);
    }
}
