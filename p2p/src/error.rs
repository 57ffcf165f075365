use std::{fmt, io};

use crate::types::PeerId;

/// A single field-level validation failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// Path of the offending field, e.g. `.wsPort` or `.peers[3].ip`.
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum P2pError {
    #[error("{0}")]
    NotEnoughPeers(String),
    #[error("Request failed: {0}")]
    RequestFail(String),
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),
    #[error("Invalid RPC response: {0}")]
    InvalidRpcResponse(String),
    #[error("Invalid RPC request: {0}")]
    InvalidRpcRequest(String),
    #[error("Invalid protocol message: {0}")]
    InvalidProtocolMessage(String),
    #[error("Transport failure on peer {peer_id}: {message}")]
    PeerTransport { peer_id: PeerId, message: String },
    #[error("A response has already been sent for request '{0}'")]
    RpcResponseAlreadySent(String),
    #[error("Invalid handshake: {}", join_field_errors(.0))]
    InvalidHandshake(Vec<FieldError>),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(PeerId),
    #[error("The P2P node is already started")]
    AlreadyStarted,
    #[error("The P2P node is not active")]
    NotActive,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    QueryEncoding(#[from] serde_urlencoded::ser::Error),
}

impl P2pError {
    pub fn transport(peer_id: &PeerId, message: impl Into<String>) -> Self {
        Self::PeerTransport {
            peer_id: peer_id.clone(),
            message: message.into(),
        }
    }

    /// The peer this error should be attributed to, if any.
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::PeerTransport { peer_id, .. } | Self::ConnectTimeout(peer_id) => Some(peer_id),
            _ => None,
        }
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
