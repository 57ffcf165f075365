//! The main entry point of this crate, composed of three parts:
//!
//! - `P2p`: the handle used by the application to start and stop the node, send requests
//!   and messages, and publish its own status.
//!
//! - `Server`: the task that accepts inbound connections and dispatches what the
//!   connections report to the peer pool.
//!
//! - `P2pEvent`: the events sent to the application.
//!
//! ## Lifecycle
//!
//! `Inactive -> Starting -> Active -> Stopping -> Inactive`. `start` returns once the
//! listener is bound, the seed peers were queried and the discovered peers were dialed.
//! `stop` disconnects every peer, then stops the server task and closes the listener.
//! Both run one at a time: a `stop` issued while the node is starting waits for `start`.

use std::{net::SocketAddr, sync::Arc};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::{JoinHandle, JoinSet},
};
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream};

use crate::{
    config::P2pConfig,
    error::P2pError,
    pool::PeerPool,
    transport::{self, ConnectionEvent, P2pRequest},
    types::{
        NetworkStatus, NodeInfo, P2pMessagePacket, P2pPenalty, P2pRequestPacket,
        P2pResponsePacket, PeerId, PeerInfo,
    },
};

/// Events sent to the application.
#[derive(Debug)]
pub enum P2pEvent {
    NewInboundPeer(PeerInfo),
    NewPeer(PeerInfo),
    FailedToAddInboundPeer { remote: SocketAddr, reason: String },
    /// A request the node itself has to answer.
    RequestReceived(P2pRequest),
    MessageReceived {
        peer_id: PeerId,
        message: P2pMessagePacket,
    },
    ConnectOutbound(PeerInfo),
    ConnectAbortOutbound(PeerInfo),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum P2pState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

pub struct P2p {
    config: P2pConfig,
    pool: PeerPool,
    state: Arc<Mutex<P2pState>>,
    lifecycle: tokio::sync::Mutex<()>,
    event_sender: UnboundedSender<P2pEvent>,
    /// Parked here while the server is not running.
    connection_events: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
    server: Mutex<Option<ServerHandle>>,
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<(TcpListener, UnboundedReceiver<ConnectionEvent>)>,
}

/// Create the `P2p` handle and the `P2pEvent` stream.
pub fn new(
    config: P2pConfig,
) -> Result<(P2p, impl Stream<Item = P2pEvent> + Send + Unpin), P2pError> {
    config.validate()?;

    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let event_stream = UnboundedReceiverStream::new(event_receiver);
    let (pool, connection_events) = PeerPool::new(&config, event_sender.clone());

    let p2p = P2p {
        config,
        pool,
        state: Arc::new(Mutex::new(P2pState::Inactive)),
        lifecycle: tokio::sync::Mutex::new(()),
        event_sender,
        connection_events: Mutex::new(Some(connection_events)),
        server: Mutex::new(None),
    };

    Ok((p2p, event_stream))
}

impl P2p {
    pub fn state(&self) -> P2pState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == P2pState::Active
    }

    /// The status we advertise. Once started, `ws_port` is the port actually bound.
    pub fn node_info(&self) -> NodeInfo {
        self.pool.node_info()
    }

    pub fn pool(&self) -> &PeerPool {
        &self.pool
    }

    pub async fn start(&self) -> Result<(), P2pError> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock();
            if *state != P2pState::Inactive {
                return Err(P2pError::AlreadyStarted);
            }
            *state = P2pState::Starting;
        }

        let listener = match TcpListener::bind(self.config.listen_addr()).await {
            Ok(listener) => listener,
            Err(err) => {
                *self.state.lock() = P2pState::Inactive;
                return Err(err.into());
            }
        };
        let local_addr = listener.local_addr()?;
        self.pool.set_listen_port(local_addr.port());

        let Some(connection_events) = self.connection_events.lock().take() else {
            *self.state.lock() = P2pState::Inactive;
            return Err(P2pError::AlreadyStarted);
        };

        let (shutdown, shutdown_receiver) = oneshot::channel();
        let server = Server {
            listener,
            pool: self.pool.clone(),
            state: self.state.clone(),
            event_sender: self.event_sender.clone(),
            connection_events,
            shutdown: shutdown_receiver,
            handshakes: JoinSet::new(),
        };
        *self.state.lock() = P2pState::Active;
        let task = tokio::spawn(server.run());
        *self.server.lock() = Some(ServerHandle { shutdown, task });
        info!("📣 P2P node listening on {local_addr}");

        let seeds = self.config.seed_peer_infos();
        if !seeds.is_empty() {
            let discovered = self
                .pool
                .run_discovery(seeds, &self.config.blacklisted_peers)
                .await;
            self.pool.add_new_peers(discovered);
        }
        self.pool.connect_to_peers(self.pool.new_peer_infos()).await;

        Ok(())
    }

    pub async fn stop(&self) -> Result<(), P2pError> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock();
            if *state != P2pState::Active {
                return Ok(());
            }
            *state = P2pState::Stopping;
        }

        self.pool.remove_all_peers();

        let server = self.server.lock().take();
        if let Some(ServerHandle { shutdown, task }) = server {
            let _ = shutdown.send(());
            match task.await {
                Ok((listener, connection_events)) => {
                    drop(listener);
                    *self.connection_events.lock() = Some(connection_events);
                }
                Err(err) => error!("❌ P2P server task failed: {err}"),
            }
        }

        *self.state.lock() = P2pState::Inactive;
        info!("📣 P2P node stopped");
        Ok(())
    }

    /// Send a request to one peer selected with our height as the hint.
    pub async fn request(&self, packet: P2pRequestPacket) -> Result<P2pResponsePacket, P2pError> {
        if !self.is_active() {
            return Err(P2pError::NotActive);
        }
        let height = self.node_info().height;
        self.pool.request_peer(packet, height).await
    }

    /// Broadcast a message. Nothing happens if no peer qualifies.
    pub fn send(&self, message: P2pMessagePacket) {
        let height = self.node_info().height;
        self.pool.send_to_peers(message, height);
    }

    /// Update our height and options and push them to the connected peers.
    /// `os`, `version` and `ws_port` keep their current values.
    pub async fn apply_node_info(&self, node_info: NodeInfo) {
        let current = self.node_info();
        let node_info = NodeInfo {
            os: current.os,
            version: current.version,
            ws_port: current.ws_port,
            height: node_info.height,
            options: node_info.options,
        };
        self.pool.apply_node_info(node_info).await;
    }

    pub fn get_network_status(&self) -> NetworkStatus {
        self.pool.network_status()
    }

    pub fn apply_penalty(&self, penalty: P2pPenalty) {
        debug!("☕ Ignoring penalty {:?}", penalty);
    }
}

pub struct Server {
    listener: TcpListener,
    pool: PeerPool,
    state: Arc<Mutex<P2pState>>,
    event_sender: UnboundedSender<P2pEvent>,
    connection_events: UnboundedReceiver<ConnectionEvent>,
    shutdown: oneshot::Receiver<()>,
    /// Inbound connections still waiting for their handshake.
    handshakes: JoinSet<()>,
}

impl Server {
    /// Run until shut down. Hands the listener and the event receiver back for a restart.
    pub async fn run(mut self) -> (TcpListener, UnboundedReceiver<ConnectionEvent>) {
        loop {
            select! {
                _ = &mut self.shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.handle_inbound(stream, remote),
                    Err(err) => warn!("❌ Failed to accept a connection: {err}"),
                },
                Some(event) = self.connection_events.recv() => {
                    self.pool.handle_connection_event(event);
                }
                Some(_) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {}
            }
        }

        self.handshakes.shutdown().await;
        (self.listener, self.connection_events)
    }

    fn handle_inbound(&mut self, mut stream: TcpStream, remote: SocketAddr) {
        let pool = self.pool.clone();
        let state = self.state.clone();
        let events = self.event_sender.clone();

        self.handshakes.spawn(async move {
            let settings = pool.settings();
            match transport::read_handshake(&mut stream, settings).await {
                Ok(query) => {
                    let info = query.into_peer_info(remote.ip());
                    // Checked under the state lock so that `stop` cannot miss this peer.
                    let is_new = {
                        let state = state.lock();
                        if *state != P2pState::Active {
                            debug!("☕ Dropping inbound peer {}, node is stopping", info.peer_id());
                            return;
                        }
                        pool.accept_inbound(stream, info.clone())
                    };
                    if is_new {
                        info!("📣 >> [P2P-IN] New inbound peer {}", info.peer_id());
                        let _ = events.send(P2pEvent::NewInboundPeer(info.clone()));
                        let _ = events.send(P2pEvent::NewPeer(info.clone()));
                        pool.add_new_peers(vec![info]);
                    }
                }
                Err(rejection) => {
                    error!("❌ >> [P2P-IN] Rejected {}: {}", remote, rejection.reason());
                    transport::reject(stream, &rejection, settings.max_frame_size).await;
                    let _ = events.send(P2pEvent::FailedToAddInboundPeer {
                        remote,
                        reason: P2pError::from(rejection).to_string(),
                    });
                }
            }
        });
    }
}
