//! The peer pool owns every piece of peer state: the `new`, `tried` and `connected` sets
//! and the connections attached to connected peers.
//!
//! Per-peer failures stop here. They are logged and turned into events or demotions, never
//! into errors of a multi-peer operation.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
};

use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::{net::TcpStream, sync::mpsc::{self, UnboundedReceiver, UnboundedSender}};

use crate::{
    config::P2pConfig,
    discovery::{discover_peers, DiscoveryOptions},
    error::P2pError,
    peer::{Peer, PROCEDURE_LIST, PROCEDURE_UPDATE_MYSELF},
    selection::{select_for_connection, select_peers, SelectionParams},
    service::P2pEvent,
    transport::{
        Connection, ConnectionEvent, ConnectionKind, P2pRequest, TransportSettings,
        INTENTIONAL_DISCONNECT_CODE,
    },
    types::{
        NetworkStatus, NodeInfo, P2pMessagePacket, P2pRequestPacket, P2pResponsePacket, PeerId,
        PeerInfo, ProtocolPeerInfoList,
    },
    validation::ValidationContext,
};

#[derive(Clone)]
pub struct PeerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: RwLock<PoolState>,
    node_info: RwLock<NodeInfo>,
    host_address: IpAddr,
    settings: TransportSettings,
    validation: Arc<ValidationContext>,
    send_peer_limit: usize,
    connection_events: UnboundedSender<ConnectionEvent>,
    events: UnboundedSender<P2pEvent>,
}

#[derive(Default)]
struct PoolState {
    new_peers: HashMap<PeerId, PeerInfo>,
    tried_peers: HashMap<PeerId, PeerInfo>,
    /// Connected peers, by id.
    peers: HashMap<PeerId, Peer>,
}

impl PeerPool {
    /// Create a pool. The returned receiver yields what its connections report and must be
    /// fed back through `handle_connection_event`.
    pub fn new(
        config: &P2pConfig,
        events: UnboundedSender<P2pEvent>,
    ) -> (Self, UnboundedReceiver<ConnectionEvent>) {
        let validation = ValidationContext::from_config(config);
        let (connection_events, connection_receiver) = mpsc::unbounded_channel();

        let inner = PoolInner {
            state: RwLock::new(PoolState::default()),
            node_info: RwLock::new(config.node_info.clone()),
            host_address: config.host_address,
            settings: TransportSettings {
                connect_timeout: config.connect_timeout(),
                request_timeout: config.request_timeout(),
                max_frame_size: config.max_frame_size(),
                validation: validation.clone(),
            },
            validation: Arc::new(validation),
            send_peer_limit: config.send_peer_limit(),
            connection_events,
            events,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            connection_receiver,
        )
    }

    pub fn node_info(&self) -> NodeInfo {
        self.inner.node_info.read().clone()
    }

    pub(crate) fn set_listen_port(&self, ws_port: u16) {
        self.inner.node_info.write().ws_port = ws_port;
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// Register an inbound connection. Returns `true` if the peer was not connected before.
    pub fn add_inbound_peer(&self, peer_id: PeerId, info: PeerInfo, connection: Connection) -> bool {
        let mut state = self.inner.state.write();
        if let Some(peer) = state.peers.get_mut(&peer_id) {
            if let Some(previous) = peer.attach(connection) {
                previous.disconnect(INTENTIONAL_DISCONNECT_CODE, "Replaced by a newer connection");
            }
            return false;
        }

        let mut peer = Peer::new(info, self.inner.validation.clone());
        peer.attach(connection);
        state.peers.insert(peer_id, peer.clone());
        drop(state);

        let node_info = self.node_info();
        tokio::spawn(async move {
            if let Err(err) = peer.apply_node_info(&node_info).await {
                warn!("❌ Failed to send node info to {}: {}", peer.id(), err);
            }
        });

        true
    }

    /// Accept a stream whose handshake was validated.
    pub(crate) fn accept_inbound(&self, stream: TcpStream, info: PeerInfo) -> bool {
        let peer_id = info.peer_id();
        let connection = Connection::spawn(
            stream,
            peer_id.clone(),
            ConnectionKind::Inbound,
            &self.inner.settings,
            self.inner.connection_events.clone(),
        );
        self.add_inbound_peer(peer_id, info, connection)
    }

    /// Dial a peer. On success it is in `tried` and `connected`.
    pub async fn connect_outbound(&self, info: PeerInfo) -> Result<Peer, P2pError> {
        let peer_id = info.peer_id();
        {
            let mut state = self.inner.state.write();
            state.new_peers.remove(&peer_id);
            state.tried_peers.insert(peer_id.clone(), info.as_tried());
        }

        let node_info = self.node_info();
        let result = Connection::connect(
            info.socket_addr(),
            &node_info,
            &self.inner.settings,
            self.inner.connection_events.clone(),
        )
        .await;

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                self.inner.state.write().tried_peers.remove(&peer_id);
                let _ = self.inner.events.send(P2pEvent::ConnectAbortOutbound(info));
                return Err(err);
            }
        };

        let peer = {
            let mut state = self.inner.state.write();
            let validation = self.inner.validation.clone();
            let peer = state
                .peers
                .entry(peer_id)
                .or_insert_with(|| Peer::new(info.as_tried(), validation));
            if let Some(previous) = peer.attach(connection) {
                previous.disconnect(INTENTIONAL_DISCONNECT_CODE, "Replaced by a newer connection");
            }
            peer.clone()
        };

        debug!("☕ Connected to {}", peer.id());
        let _ = self.inner.events.send(P2pEvent::ConnectOutbound(info));
        Ok(peer)
    }

    /// Dial every candidate we have no outbound connection to yet.
    pub async fn connect_to_peers(&self, candidates: Vec<PeerInfo>) {
        let candidates: Vec<PeerInfo> = select_for_connection(candidates)
            .into_iter()
            .filter(|info| !self.has_outbound(&info.peer_id()) && !self.is_self(info))
            .collect();

        let results = join_all(
            candidates
                .iter()
                .map(|info| self.connect_outbound(info.clone())),
        )
        .await;

        for (info, result) in candidates.iter().zip(results) {
            if let Err(err) = result {
                warn!("❌ Failed to connect to {}: {}", info.peer_id(), err);
            }
        }
    }

    /// Push our status to every connected peer.
    pub async fn apply_node_info(&self, node_info: NodeInfo) {
        *self.inner.node_info.write() = node_info.clone();

        let peers = self.get_all_peers();
        let results = join_all(peers.iter().map(|peer| peer.apply_node_info(&node_info))).await;
        for (peer, result) in peers.iter().zip(results) {
            if let Err(err) = result {
                warn!("❌ Failed to send node info to {}: {}", peer.id(), err);
            }
        }
    }

    /// Send a request to one selected peer.
    pub async fn request_peer(
        &self,
        packet: P2pRequestPacket,
        last_block_height: u64,
    ) -> Result<P2pResponsePacket, P2pError> {
        let infos = self.get_all_peer_infos();
        let selected = select_peers(&infos, SelectionParams::new(last_block_height), 1)
            .map_err(|err| {
                P2pError::RequestFail(format!(
                    "Request failed due to no peers found in peer selection: {err}"
                ))
            })?;

        let peer = selected
            .first()
            .and_then(|info| self.get_peer(&info.peer_id()))
            .ok_or_else(|| P2pError::RequestFail("Selected peer is gone".to_owned()))?;

        peer.request(packet).await
    }

    /// Broadcast to at most `send_peer_limit` selected peers. Best effort.
    pub fn send_to_peers(&self, message: P2pMessagePacket, last_block_height: u64) {
        let infos = self.get_all_peer_infos();
        let params = SelectionParams::new(last_block_height);
        let mut selected = select_peers(&infos, params, 0).unwrap_or_default();
        if selected.len() > self.inner.send_peer_limit {
            selected = select_peers(&infos, params, self.inner.send_peer_limit).unwrap_or_default();
        }

        for info in selected {
            let Some(peer) = self.get_peer(&info.peer_id()) else {
                continue;
            };
            if let Err(err) = peer.send(message.clone()) {
                warn!("❌ Failed to send '{}' to {}: {}", message.event, peer.id(), err);
            }
        }
    }

    /// Discover peers through the seeds, or through the connected peers when no seed is given.
    pub async fn run_discovery(&self, seeds: Vec<PeerInfo>, blacklist: &[IpAddr]) -> Vec<PeerInfo> {
        let sources: Vec<Peer> = if seeds.is_empty() {
            self.get_all_peers()
        } else {
            let dials = seeds
                .into_iter()
                .filter(|seed| !blacklist.contains(&seed.ip_address) && !self.is_self(seed))
                .map(|seed| async move {
                    match self.get_peer(&seed.peer_id()) {
                        Some(peer) => Some(peer),
                        None => self
                            .connect_outbound(seed)
                            .await
                            .map_err(|err| warn!("❌ Seed peer unreachable: {}", err))
                            .ok(),
                    }
                });
            join_all(dials).await.into_iter().flatten().collect()
        };

        let options = DiscoveryOptions {
            blacklist: blacklist.to_vec(),
        };
        let discovered = discover_peers(&sources, &options).await;
        debug!("☕ Discovered {} peers from {} sources", discovered.len(), sources.len());

        discovered
            .into_iter()
            .filter(|info| !self.is_self(info))
            .collect()
    }

    /// Add peers to `new`, unless they are already known.
    pub fn add_new_peers(&self, infos: Vec<PeerInfo>) {
        let mut state = self.inner.state.write();
        for info in infos {
            let peer_id = info.peer_id();
            if !state.tried_peers.contains_key(&peer_id) && !state.new_peers.contains_key(&peer_id) {
                state.new_peers.insert(peer_id, info);
            }
        }
    }

    /// Disconnect a peer and forget it.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let mut state = self.inner.state.write();
        state.new_peers.remove(peer_id);
        state.tried_peers.remove(peer_id);
        if let Some(peer) = state.peers.remove(peer_id) {
            peer.disconnect(INTENTIONAL_DISCONNECT_CODE, "Intentionally removed");
        }
    }

    /// Tear down every connection and clear all three sets.
    pub fn remove_all_peers(&self) {
        let mut state = self.inner.state.write();
        for peer in state.peers.values() {
            peer.disconnect(INTENTIONAL_DISCONNECT_CODE, "Node is shutting down");
        }
        *state = PoolState::default();
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.inner.state.read().peers.get(peer_id).cloned()
    }

    pub fn get_all_peers(&self) -> Vec<Peer> {
        self.inner.state.read().peers.values().cloned().collect()
    }

    pub fn get_all_peer_infos(&self) -> Vec<PeerInfo> {
        self.inner
            .state
            .read()
            .peers
            .values()
            .map(|peer| peer.info().clone())
            .collect()
    }

    pub fn new_peer_infos(&self) -> Vec<PeerInfo> {
        self.inner.state.read().new_peers.values().cloned().collect()
    }

    pub fn network_status(&self) -> NetworkStatus {
        let state = self.inner.state.read();
        NetworkStatus {
            new_peers: state.new_peers.values().cloned().collect(),
            tried_peers: state.tried_peers.values().cloned().collect(),
            connected_peers: state.peers.values().map(|peer| peer.info().clone()).collect(),
        }
    }

    fn has_outbound(&self, peer_id: &PeerId) -> bool {
        self.inner
            .state
            .read()
            .peers
            .get(peer_id)
            .map_or(false, Peer::has_outbound)
    }

    /// Whether `info` points at this node's own listener.
    fn is_self(&self, info: &PeerInfo) -> bool {
        let ip = info.ip_address;
        info.ws_port == self.inner.node_info.read().ws_port
            && (ip.is_loopback() || ip.is_unspecified() || ip == self.inner.host_address)
    }

    /// Answer built-in procedures and forward the rest to the application.
    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Request(request) => match request.procedure() {
                PROCEDURE_LIST => self.handle_list(request),
                PROCEDURE_UPDATE_MYSELF => self.handle_update_myself(request),
                _ => {
                    info!("📣 >> [P2P-IN] {} from {}", request.procedure(), request.peer_id());
                    let _ = self.inner.events.send(P2pEvent::RequestReceived(request));
                }
            },
            ConnectionEvent::Message { peer_id, message } => {
                info!("📣 >> [P2P-IN] {} from {}", message.event, peer_id);
                let _ = self
                    .inner
                    .events
                    .send(P2pEvent::MessageReceived { peer_id, message });
            }
            ConnectionEvent::Closed {
                peer_id,
                connection_id,
                reason,
            } => {
                let mut state = self.inner.state.write();
                let Some(peer) = state.peers.get_mut(&peer_id) else {
                    return;
                };
                if peer.detach(connection_id) && !peer.is_connected() {
                    debug!("☕ Peer {} left connected peers: {}", peer_id, reason);
                    state.peers.remove(&peer_id);
                }
            }
        }
    }

    fn handle_list(&self, mut request: P2pRequest) {
        let requester = request.peer_id().clone();
        let peers = self
            .inner
            .state
            .read()
            .peers
            .values()
            .filter(|peer| *peer.id() != requester)
            .map(|peer| peer.info().to_protocol())
            .collect();

        let list = ProtocolPeerInfoList {
            success: true,
            peers,
        };
        let result = serde_json::to_value(list)
            .map_err(P2pError::from)
            .and_then(|data| request.respond(data));
        if let Err(err) = result {
            warn!("❌ Failed to answer '{}' from {}: {}", PROCEDURE_LIST, requester, err);
        }
    }

    fn handle_update_myself(&self, mut request: P2pRequest) {
        let peer_id = request.peer_id().clone();
        let result = match self.updated_peer_info(&peer_id, request.data()) {
            Ok(info) => {
                let mut state = self.inner.state.write();
                if let Some(peer) = state.peers.remove(&peer_id) {
                    state.peers.insert(peer_id.clone(), peer.with_info(info));
                }
                request.respond(json!({ "success": true }))
            }
            Err(err) => {
                warn!("❌ Invalid status update from {}: {}", peer_id, err);
                request.respond_error(err.to_string())
            }
        };

        if let Err(err) = result {
            warn!("❌ Failed to answer '{}' from {}: {}", PROCEDURE_UPDATE_MYSELF, peer_id, err);
        }
    }

    /// Build the record replacing the stored one. Identity fields never change.
    fn updated_peer_info(&self, peer_id: &PeerId, data: &Value) -> Result<PeerInfo, P2pError> {
        let node_info: NodeInfo = serde_json::from_value(data.clone())
            .map_err(|err| P2pError::InvalidPeer(err.to_string()))?;
        if !self.inner.validation.is_valid_version(&node_info.version) {
            return Err(P2pError::InvalidPeer(format!(
                "Invalid peer version '{}'",
                node_info.version
            )));
        }

        let current = self
            .get_peer(peer_id)
            .ok_or_else(|| P2pError::InvalidPeer(format!("Unknown peer {peer_id}")))?;
        let current = current.info();

        Ok(PeerInfo {
            ip_address: current.ip_address,
            ws_port: current.ws_port,
            height: node_info.height,
            os: Some(node_info.os),
            version: Some(node_info.version),
            options: node_info.options,
            is_tried_peer: current.is_tried_peer,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{net::TcpListener, time};

    use super::*;

    fn config() -> P2pConfig {
        P2pConfig::default()
            .with_host_address("127.0.0.1".parse().unwrap())
            .with_connect_timeout(Some(500))
            .with_request_timeout(Some(500))
    }

    fn peer(ip: &str, port: u16, height: u64) -> PeerInfo {
        PeerInfo::new(ip.parse().unwrap(), port, height)
    }

    fn new_pool() -> (PeerPool, UnboundedReceiver<ConnectionEvent>, UnboundedReceiver<P2pEvent>) {
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (pool, connection_receiver) = PeerPool::new(&config(), events);
        (pool, connection_receiver, event_receiver)
    }

    /// An inbound connection whose remote end is served by a second pool.
    async fn inbound_connection(pool: &PeerPool, remote: &PeerPool, info: &PeerInfo) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

        Connection::spawn(
            client.unwrap(),
            PeerId::from("pool"),
            ConnectionKind::Outbound,
            remote.settings(),
            remote.inner.connection_events.clone(),
        );
        Connection::spawn(
            server.unwrap().0,
            info.peer_id(),
            ConnectionKind::Inbound,
            pool.settings(),
            pool.inner.connection_events.clone(),
        )
    }

    #[test]
    fn new_and_tried_stay_exclusive() {
        let (pool, _, _) = new_pool();
        pool.inner
            .state
            .write()
            .tried_peers
            .insert(peer("10.0.0.1", 5000, 1).peer_id(), peer("10.0.0.1", 5000, 1));

        pool.add_new_peers(vec![peer("10.0.0.1", 5000, 1), peer("10.0.0.2", 5000, 1)]);
        pool.add_new_peers(vec![peer("10.0.0.2", 5000, 9)]);

        let status = pool.network_status();
        assert_eq!(status.new_peers.len(), 1);
        assert_eq!(status.new_peers[0].height, 1);
        assert_eq!(status.tried_peers.len(), 1);
        assert!(status.connected_peers.is_empty());
    }

    #[tokio::test]
    async fn request_without_peers_fails() {
        let (pool, _, _) = new_pool();
        let err = pool
            .request_peer(P2pRequestPacket::new("blocks", Value::Null), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::RequestFail(_)));

        // Broadcasting to nobody is fine.
        pool.send_to_peers(P2pMessagePacket::new("postBlock", Value::Null), 0);
    }

    #[tokio::test]
    async fn failed_dial_is_reported_and_forgotten() {
        let (pool, _, mut events) = new_pool();
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let target = peer("127.0.0.1", port, 1);
        pool.add_new_peers(vec![target.clone()]);
        pool.connect_to_peers(vec![target.clone()]).await;

        let status = pool.network_status();
        assert!(status.new_peers.is_empty());
        assert!(status.tried_peers.is_empty());
        assert!(status.connected_peers.is_empty());
        assert!(matches!(
            events.recv().await,
            Some(P2pEvent::ConnectAbortOutbound(info)) if info == target
        ));
    }

    #[tokio::test]
    async fn inbound_peers_are_registered_once() {
        let (pool, _pool_rx, _) = new_pool();
        let (remote, _remote_rx, _) = new_pool();
        let info = peer("127.0.0.1", 6001, 5);

        let first = inbound_connection(&pool, &remote, &info).await;
        assert!(pool.add_inbound_peer(info.peer_id(), info.clone(), first));
        let second = inbound_connection(&pool, &remote, &info).await;
        assert!(!pool.add_inbound_peer(info.peer_id(), info.clone(), second));

        assert_eq!(pool.get_all_peer_infos(), vec![info.clone()]);

        pool.remove_peer(&info.peer_id());
        assert!(pool.get_all_peers().is_empty());
    }

    #[tokio::test]
    async fn closed_connection_demotes_the_peer() {
        let (pool, mut pool_rx, _) = new_pool();
        let (remote, _remote_rx, _) = new_pool();
        let info = peer("127.0.0.1", 6002, 5);

        let connection = inbound_connection(&pool, &remote, &info).await;
        pool.add_inbound_peer(info.peer_id(), info.clone(), connection.clone());
        connection.disconnect(INTENTIONAL_DISCONNECT_CODE, "test");

        let event = time::timeout(Duration::from_secs(2), async {
            loop {
                match pool_rx.recv().await {
                    Some(event @ ConnectionEvent::Closed { .. }) => break event,
                    Some(other) => pool.handle_connection_event(other),
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .unwrap();
        pool.handle_connection_event(event);

        assert!(pool.network_status().connected_peers.is_empty());
    }

    #[test]
    fn own_address_is_not_a_candidate() {
        let mut config = config();
        config.node_info.ws_port = 7000;
        let (events, _rx) = mpsc::unbounded_channel();
        let (pool, _) = PeerPool::new(&config, events);

        assert!(pool.is_self(&peer("127.0.0.1", 7000, 0)));
        assert!(!pool.is_self(&peer("127.0.0.1", 7001, 0)));
        assert!(!pool.is_self(&peer("10.1.1.1", 7000, 0)));
    }
}
