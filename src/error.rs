//! Error kinds surfaced by the connection and RPC layers.

use std::io;

use thiserror::Error;

/// Errors produced by the overlay's connection, RPC and routing layers.
///
/// Lookup rounds never surface these to callers; they are logged and the
/// round continues with whatever contacts answered.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Transport-level connect or handshake failure.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No next hop was available while relaying a routed message.
    #[error("could not route message: {0}")]
    CouldNotRoute(String),

    #[error("cannot connect to self")]
    CannotConnectToSelf,

    /// Start called on a module that was already started or stopped.
    #[error("could not start: {0}")]
    CouldNotStart(String),

    /// Stop called on a module that was never started.
    #[error("could not stop: {0}")]
    CouldNotStop(String),

    #[error("unknown rpc method: {0}")]
    UnknownRpcMethod(String),

    /// A transport reported a state transition it should never make.
    #[error("illegal peer connection state: {0}")]
    IllegalPeerConnectionState(String),

    #[error("websocket connection request rejected: {0}")]
    WebSocketConnectionRequestRejected(String),

    #[error("rpc request {method} timed out")]
    RpcTimeout { method: String },

    /// The remote handler answered with an error.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// The component was stopped or has not been started.
    #[error("not running")]
    NotRunning,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, DhtError>;
