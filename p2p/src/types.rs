//! Value types shared by the pool, discovery and the facade.
//!
//! Peers are identified by `ip:port`. `PeerInfo` is an immutable snapshot: equality and
//! hashing go through the identity key, never through the status fields.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::P2pError;

/// Free-form key/value options carried next to a peer's status (broadhash, nonce, ...).
pub type InfoOptions = Map<String, Value>;

/// The identity key of a peer: `ip:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(ip: IpAddr, ws_port: u16) -> Self {
        Self(SocketAddr::new(ip, ws_port).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What we know about a remote peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub ip_address: IpAddr,
    pub ws_port: u16,
    #[serde(default)]
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: InfoOptions,
    #[serde(default)]
    pub is_tried_peer: bool,
}

impl PeerInfo {
    pub fn new(ip_address: IpAddr, ws_port: u16, height: u64) -> Self {
        Self {
            ip_address,
            ws_port,
            height,
            os: None,
            version: None,
            options: InfoOptions::new(),
            is_tried_peer: false,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.ip_address, self.ws_port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.ws_port)
    }

    /// A copy flagged as a peer we have tried to dial.
    pub fn as_tried(&self) -> Self {
        Self {
            is_tried_peer: true,
            ..self.clone()
        }
    }

    /// The representation exchanged with remote peers through the `list` procedure.
    pub fn to_protocol(&self) -> ProtocolPeerInfo {
        ProtocolPeerInfo {
            ip: self.ip_address.to_string(),
            ws_port: self.ws_port,
            height: self.height,
            os: self.os.clone(),
            version: self.version.clone().unwrap_or_default(),
            broadhash: self
                .options
                .get("broadhash")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            nonce: self
                .options
                .get("nonce")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        }
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.ip_address == other.ip_address && self.ws_port == other.ws_port
    }
}

impl Eq for PeerInfo {}

impl Hash for PeerInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip_address.hash(state);
        self.ws_port.hash(state);
    }
}

/// The local node's own status, advertised to peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub os: String,
    pub version: String,
    pub ws_port: u16,
    #[serde(default)]
    pub height: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: InfoOptions,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            version: "1.0.0".to_owned(),
            ws_port: 0,
            height: 0,
            options: InfoOptions::new(),
        }
    }
}

impl NodeInfo {
    /// The handshake URL sent as the first frame of an outbound connection.
    pub fn handshake_url(&self) -> Result<String, P2pError> {
        let query = serde_urlencoded::to_string(HandshakeParams {
            ws_port: self.ws_port,
            os: &self.os,
            version: &self.version,
            height: self.height,
        })?;
        Ok(format!("/?{query}"))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeParams<'a> {
    ws_port: u16,
    os: &'a str,
    version: &'a str,
    height: u64,
}

/// Peer entry of a `list` response, in the field layout remote nodes speak.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolPeerInfo {
    pub ip: String,
    pub ws_port: u16,
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadhash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Body of a `list` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolPeerInfoList {
    pub success: bool,
    pub peers: Vec<ProtocolPeerInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P2pRequestPacket {
    pub procedure: String,
    #[serde(default)]
    pub data: Value,
}

impl P2pRequestPacket {
    pub fn new(procedure: impl Into<String>, data: Value) -> Self {
        Self {
            procedure: procedure.into(),
            data,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P2pResponsePacket {
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct P2pMessagePacket {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl P2pMessagePacket {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Reserved for peer penalties; currently carries nothing the pool acts on.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pPenalty {
    pub peer_id: Option<PeerId>,
    pub penalty: u32,
}

/// Point-in-time view of the peer sets.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub new_peers: Vec<PeerInfo>,
    pub tried_peers: Vec<PeerInfo>,
    pub connected_peers: Vec<PeerInfo>,
}
