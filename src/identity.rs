//! Peer identity: ids, descriptors and the XOR metric.
//!
//! - **Identity & Hashing**: [`PeerId`], [`derive_peer_id`]
//! - **Addressing**: [`PeerDescriptor`], [`ConnectivityMethod`], [`NodeType`]
//! - **Distance Metrics**: [`xor_distance`], [`distance_cmp`]

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use iroh_blake3::Hasher;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::DhtError;

/// Length in bytes of a [`PeerId`].
pub const PEER_ID_LEN: usize = 32;

/// A XOR distance between two peer ids.
pub type Distance = [u8; PEER_ID_LEN];

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 32-byte BLAKE3 digest of the input data.
pub(crate) fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable [`PeerId`] from a human readable name.
///
/// ```
/// use overlay_dht::derive_peer_id;
///
/// let a = derive_peer_id("entrypoint");
/// assert_eq!(a, derive_peer_id("entrypoint"));
/// assert_ne!(a, derive_peer_id("peer-1"));
/// ```
pub fn derive_peer_id(name: &str) -> PeerId {
    PeerId(blake3_digest(name.as_bytes()))
}

// ============================================================================
// Peer Id
// ============================================================================

/// A 256-bit peer identifier.
///
/// Serialized as a lowercase hex string in human-readable formats such as
/// config files, and as 32 raw bytes on the wire. Ordering is plain lexicographic byte order, which is the total order
/// used to break ties between duplicate connections.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// A uniformly random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn distance(&self, other: &PeerId) -> Distance {
        xor_distance(self, other)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|err| DhtError::Malformed(format!("peer id: {err}")))?;
        let bytes: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| DhtError::Malformed(format!("peer id must be {PEER_ID_LEN} bytes")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            <[u8; PEER_ID_LEN]>::deserialize(deserializer).map(Self)
        }
    }
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two peer ids.
pub fn xor_distance(a: &PeerId, b: &PeerId) -> Distance {
    let mut out = [0u8; PEER_ID_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    out
}

/// Compare two XOR distances as unsigned big-endian integers.
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

// ============================================================================
// Peer Descriptor
// ============================================================================

/// Kind of runtime the peer runs in. Browsers cannot host a WebSocket server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    NodeJs,
    Browser,
}

/// A publicly reachable WebSocket endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectivityMethod {
    pub ip: String,
    pub port: u16,
}

impl ConnectivityMethod {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for ConnectivityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// The routable address record exchanged between peers.
///
/// Two descriptors are equal when their peer ids are equal; the address part
/// may legitimately differ between observations of the same peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub websocket: Option<ConnectivityMethod>,
    #[serde(default)]
    pub region: Option<u32>,
}

impl PeerDescriptor {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            node_type: NodeType::default(),
            websocket: None,
            region: None,
        }
    }

    pub fn with_websocket(mut self, websocket: ConnectivityMethod) -> Self {
        self.websocket = Some(websocket);
        self
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.websocket {
            Some(ws) => write!(f, "{}@{}", self.peer_id.short(), ws),
            None => f.write_str(&self.peer_id.short()),
        }
    }
}
