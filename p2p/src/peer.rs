use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::{
    discovery::PeerListSource,
    error::P2pError,
    transport::{Connection, ConnectionKind},
    types::{
        NodeInfo, P2pMessagePacket, P2pRequestPacket, P2pResponsePacket, PeerId, PeerInfo,
    },
    validation::ValidationContext,
};

/// Procedure answered with the peers a node is connected to.
pub const PROCEDURE_LIST: &str = "list";
/// Procedure a peer calls to push its own status to us.
pub const PROCEDURE_UPDATE_MYSELF: &str = "updateMyself";

/// A remote node with at most one inbound and one outbound connection.
///
/// The status snapshot is never edited in place: `with_info` swaps in a whole new record.
#[derive(Clone, Debug)]
pub struct Peer {
    id: PeerId,
    info: PeerInfo,
    inbound: Option<Connection>,
    outbound: Option<Connection>,
    validation: Arc<ValidationContext>,
}

impl Peer {
    pub fn new(info: PeerInfo, validation: Arc<ValidationContext>) -> Self {
        Self {
            id: info.peer_id(),
            info,
            inbound: None,
            outbound: None,
            validation,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn with_info(mut self, info: PeerInfo) -> Self {
        self.info = info;
        self
    }

    /// Attach a connection, returning the one it replaces.
    pub fn attach(&mut self, connection: Connection) -> Option<Connection> {
        match connection.kind() {
            ConnectionKind::Inbound => self.inbound.replace(connection),
            ConnectionKind::Outbound => self.outbound.replace(connection),
        }
    }

    /// Forget the connection with the given id. Returns whether it was attached.
    pub fn detach(&mut self, connection_id: u64) -> bool {
        for slot in [&mut self.inbound, &mut self.outbound] {
            if slot.as_ref().map(Connection::id) == Some(connection_id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connections().next().is_some()
    }

    fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.outbound
            .iter()
            .chain(self.inbound.iter())
            .filter(|conn| !conn.is_closed())
    }

    fn connection(&self) -> Result<&Connection, P2pError> {
        self.connections()
            .next()
            .ok_or_else(|| P2pError::transport(&self.id, "Peer is not connected"))
    }

    pub async fn request(&self, packet: P2pRequestPacket) -> Result<P2pResponsePacket, P2pError> {
        info!("📣 << [P2P-OUT] {} to {}", packet.procedure, self.id);
        self.connection()?.request(packet).await
    }

    pub fn send(&self, message: P2pMessagePacket) -> Result<(), P2pError> {
        info!("📣 << [P2P-OUT] {} to {}", message.event, self.id);
        self.connection()?.send(message)
    }

    /// Ask the peer for the peers it is connected to.
    pub async fn fetch_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        let resp = self
            .request(P2pRequestPacket::new(PROCEDURE_LIST, serde_json::Value::Null))
            .await?;
        self.validation.validate_peer_info_list(&resp.data)
    }

    /// Push our own status to the peer.
    pub async fn apply_node_info(&self, node_info: &NodeInfo) -> Result<(), P2pError> {
        let data = serde_json::to_value(node_info)?;
        self.request(P2pRequestPacket::new(PROCEDURE_UPDATE_MYSELF, data))
            .await
            .map(|_| ())
    }

    pub fn disconnect(&self, code: u16, reason: &str) {
        for conn in self.inbound.iter().chain(self.outbound.iter()) {
            conn.disconnect(code, reason);
        }
    }
}

#[async_trait]
impl PeerListSource for Peer {
    fn source_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn fetch_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        Peer::fetch_peers(self).await
    }
}
