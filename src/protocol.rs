//! Wire messages.
//!
//! Every frame on a WebSocket or data channel carries exactly one [`Message`]
//! envelope in bincode. Bodies nest encoded payloads as raw length-prefixed
//! bytes, so relaying adds a fixed header per layer rather than inflating it. The envelope's `app_id` namespaces the method set
//! of the subsystem that owns the body, so the DHT, the connectors and
//! applications can share one transport.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DhtError, Result};
use crate::identity::{ConnectivityMethod, PeerDescriptor, PeerId};
use crate::rpc::{RpcMethod, RpcProtocol};

/// Version sent in every handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// App id of messages the connection manager handles itself.
pub const CONNECTION_MANAGER_APP_ID: &str = "connectionmanager";
/// App id of the DHT RPC surface.
pub const DHT_APP_ID: &str = "layer0";
/// App id of WebRTC signaling notifications.
pub const WEBRTC_CONNECTOR_APP_ID: &str = "webrtc_connector";
/// App id of reverse WebSocket connection requests.
pub const WEBSOCKET_CONNECTOR_APP_ID: &str = "websocket_connector";

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ConnectivityRequest,
    ConnectivityResponse,
    Handshake,
    Rpc,
}

/// The unit exchanged on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub app_id: String,
    pub message_type: MessageType,
    pub message_id: String,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(app_id: impl Into<String>, message_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            app_id: app_id.into(),
            message_type,
            message_id: Uuid::new_v4().to_string(),
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_body(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_body(bytes).map_err(|err| DhtError::Malformed(format!("envelope: {err}")))
    }

    /// Decode the body as `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_body(&self.body)
            .map_err(|err| DhtError::Malformed(format!("{:?} body: {err}", self.message_type)))
    }
}

/// Encode any wire payload.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

// ============================================================================
// Connection Manager Payloads
// ============================================================================

/// First message on every connection; binds the sender's descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub source_id: PeerId,
    pub protocol_version: String,
    pub peer_descriptor: PeerDescriptor,
}

impl HandshakeMessage {
    pub fn envelope(local: &PeerDescriptor) -> Result<Message> {
        let handshake = HandshakeMessage {
            source_id: local.peer_id,
            protocol_version: PROTOCOL_VERSION.to_string(),
            peer_descriptor: local.clone(),
        };
        Ok(Message::new(
            CONNECTION_MANAGER_APP_ID,
            MessageType::Handshake,
            encode_body(&handshake)?,
        ))
    }
}

/// Asks the receiver to dial back to the sender on `port`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectivityRequest {
    pub port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    OpenInternet,
    Unknown,
}

/// Result of a connectivity probe, as seen from the probing peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectivityResponse {
    pub open_internet: bool,
    /// The requester's address as observed by the prober.
    pub ip: String,
    pub nat_type: NatType,
    #[serde(default)]
    pub websocket: Option<ConnectivityMethod>,
}

// ============================================================================
// RPC Payloads
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcKind {
    Request,
    Response,
    Notification,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcHeader {
    pub kind: RpcKind,
    pub method: String,
}

/// Body of an [`MessageType::Rpc`] envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcMessage {
    pub header: RpcHeader,
    pub request_id: String,
    pub source: PeerDescriptor,
    pub target: PeerDescriptor,
    pub body: Vec<u8>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    UnknownMethod,
    Malformed,
    Handler,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub kind: RpcErrorKind,
    pub message: String,
}

// ----------------------------------------------------------------------------
// DHT
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClosestPeersRequest {
    pub peer_id: PeerId,
    pub requester: PeerDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub nonce: String,
}

/// A message relayed hop by hop towards `destination`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteMessageWrapper {
    pub source: PeerDescriptor,
    pub destination: PeerDescriptor,
    pub nonce: String,
    pub message: Message,
    /// Peers that already handled this message, origin first.
    #[serde(default)]
    pub route_path: Vec<PeerId>,
}

/// Requests of the DHT surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DhtRequest {
    GetClosestPeers(ClosestPeersRequest),
    Ping(PingRequest),
    RouteMessage(RouteMessageWrapper),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DhtResponse {
    ClosestPeers(Vec<PeerDescriptor>),
    Pong { nonce: String },
    RouteAck { error: Option<String> },
}

// ----------------------------------------------------------------------------
// WebRTC signaling
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebRtcConnectionRequest {
    pub requester: PeerDescriptor,
    pub target: PeerDescriptor,
    pub connection_id: String,
}

/// Carries an SDP offer or answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RtcDescription {
    pub requester: PeerDescriptor,
    pub target: PeerDescriptor,
    pub description: String,
    pub connection_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IceCandidate {
    pub requester: PeerDescriptor,
    pub target: PeerDescriptor,
    pub candidate: String,
    pub mid: Option<String>,
    #[serde(default)]
    pub mline_index: Option<u16>,
    pub connection_id: String,
}

/// Signaling notifications exchanged by WebRTC connectors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebRtcSignal {
    RequestConnection(WebRtcConnectionRequest),
    RtcOffer(RtcDescription),
    RtcAnswer(RtcDescription),
    IceCandidate(IceCandidate),
}

/// Notifications carry no payload back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalAck;

// ----------------------------------------------------------------------------
// WebSocket reverse connection
// ----------------------------------------------------------------------------

/// Asks `target` to open a WebSocket connection to `ip:port`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketConnectionRequest {
    pub requester: PeerDescriptor,
    pub target: PeerDescriptor,
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketConnectorRequest {
    RequestConnection(WebSocketConnectionRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketConnectionResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

// ============================================================================
// Protocol Bindings
// ============================================================================

/// `getClosestPeers`, `ping` and `routeMessage`.
pub struct DhtProtocol;

impl RpcProtocol for DhtProtocol {
    const APP_ID: &'static str = DHT_APP_ID;
    type Request = DhtRequest;
    type Response = DhtResponse;
}

impl RpcMethod for DhtRequest {
    const METHODS: &'static [&'static str] = &["getClosestPeers", "ping", "routeMessage"];

    fn method(&self) -> &'static str {
        match self {
            DhtRequest::GetClosestPeers(_) => "getClosestPeers",
            DhtRequest::Ping(_) => "ping",
            DhtRequest::RouteMessage(_) => "routeMessage",
        }
    }
}

/// WebRTC signaling, sent as notifications.
pub struct WebRtcProtocol;

impl RpcProtocol for WebRtcProtocol {
    const APP_ID: &'static str = WEBRTC_CONNECTOR_APP_ID;
    type Request = WebRtcSignal;
    type Response = SignalAck;
}

impl RpcMethod for WebRtcSignal {
    const METHODS: &'static [&'static str] =
        &["requestConnection", "rtcOffer", "rtcAnswer", "iceCandidate"];

    fn method(&self) -> &'static str {
        match self {
            WebRtcSignal::RequestConnection(_) => "requestConnection",
            WebRtcSignal::RtcOffer(_) => "rtcOffer",
            WebRtcSignal::RtcAnswer(_) => "rtcAnswer",
            WebRtcSignal::IceCandidate(_) => "iceCandidate",
        }
    }
}

/// Reverse WebSocket connection requests.
pub struct WebSocketConnectorProtocol;

impl RpcProtocol for WebSocketConnectorProtocol {
    const APP_ID: &'static str = WEBSOCKET_CONNECTOR_APP_ID;
    type Request = WebSocketConnectorRequest;
    type Response = WebSocketConnectionResponse;
}

impl RpcMethod for WebSocketConnectorRequest {
    const METHODS: &'static [&'static str] = &["requestConnection"];

    fn method(&self) -> &'static str {
        match self {
            WebSocketConnectorRequest::RequestConnection(_) => "requestConnection",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_peer_id;

    #[test]
    fn handshake_envelope_carries_descriptor() {
        let local = PeerDescriptor::new(derive_peer_id("local"))
            .with_websocket(ConnectivityMethod::new("127.0.0.1", 9000));
        let envelope = HandshakeMessage::envelope(&local).expect("encode handshake");
        assert_eq!(envelope.app_id, CONNECTION_MANAGER_APP_ID);
        assert_eq!(envelope.message_type, MessageType::Handshake);

        let wire = envelope.encode().expect("encode envelope");
        let decoded = Message::decode(&wire).expect("decode envelope");
        let handshake: HandshakeMessage = decoded.body_as().expect("decode body");
        assert_eq!(handshake.source_id, local.peer_id);
        assert_eq!(handshake.protocol_version, PROTOCOL_VERSION);
        assert_eq!(handshake.peer_descriptor.websocket, local.websocket);
    }

    fn rpc_envelope(
        app_id: &str,
        method: &str,
        from: &PeerDescriptor,
        to: &PeerDescriptor,
        body: Vec<u8>,
    ) -> Message {
        let rpc = RpcMessage {
            header: RpcHeader {
                kind: RpcKind::Notification,
                method: method.to_string(),
            },
            request_id: Uuid::new_v4().to_string(),
            source: from.clone(),
            target: to.clone(),
            body,
            error: None,
        };
        Message::new(app_id, MessageType::Rpc, encode_body(&rpc).expect("encode rpc"))
    }

    #[test]
    fn relaying_adds_a_bounded_header_per_layer() {
        let origin = PeerDescriptor::new(derive_peer_id("origin"));
        let relay = PeerDescriptor::new(derive_peer_id("relay"));
        let destination = PeerDescriptor::new(derive_peer_id("destination"));
        let sdp = "a".repeat(600);

        let offer = WebRtcSignal::RtcOffer(RtcDescription {
            requester: origin.clone(),
            target: destination.clone(),
            description: sdp.clone(),
            connection_id: Uuid::new_v4().to_string(),
        });
        let direct = rpc_envelope(
            WEBRTC_CONNECTOR_APP_ID,
            offer.method(),
            &origin,
            &destination,
            encode_body(&offer).expect("encode offer"),
        );
        let direct_frame = direct.encode().expect("encode direct").len();

        let routed = DhtRequest::RouteMessage(RouteMessageWrapper {
            source: origin.clone(),
            destination: destination.clone(),
            nonce: Uuid::new_v4().to_string(),
            message: direct,
            route_path: vec![origin.peer_id],
        });
        let relayed = rpc_envelope(
            DHT_APP_ID,
            routed.method(),
            &origin,
            &relay,
            encode_body(&routed).expect("encode route"),
        );
        let routed_frame = relayed.encode().expect("encode routed").len();

        assert!(direct_frame < sdp.len() + 512, "direct frame is {direct_frame} bytes");
        assert!(
            routed_frame < direct_frame + 512,
            "routing grew {direct_frame} bytes to {routed_frame}"
        );

        let back = Message::decode(&relayed.encode().expect("encode")).expect("decode");
        let rpc: RpcMessage = back.body_as().expect("rpc body");
        match decode_body::<DhtRequest>(&rpc.body).expect("route body") {
            DhtRequest::RouteMessage(wrapper) => {
                let inner: RpcMessage = wrapper.message.body_as().expect("inner rpc");
                match decode_body::<WebRtcSignal>(&inner.body).expect("signal") {
                    WebRtcSignal::RtcOffer(offer) => assert_eq!(offer.description, sdp),
                    other => panic!("unexpected signal {other:?}"),
                }
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn method_names_are_listed() {
        let ping = DhtRequest::Ping(PingRequest {
            nonce: "n".to_string(),
        });
        assert!(DhtRequest::METHODS.contains(&ping.method()));
        assert_eq!(WebRtcSignal::METHODS.len(), 4);
    }

    #[test]
    fn garbage_is_reported_as_malformed() {
        let err = Message::decode(b"\xff\xff").expect_err("garbage must not decode");
        assert!(matches!(err, DhtError::Malformed(_)));
    }
}
