use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::P2pError,
    types::{NodeInfo, PeerInfo},
};

pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 10_000;
pub const DEFAULT_SEND_PEER_LIMIT: usize = 16;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_PEER_LIST_SIZE: usize = 1000;

/// P2p Configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct P2pConfig {
    /// The host to listen on. The port is `node_info.ws_port`, 0 lets the OS pick one.
    #[serde(default = "default_host_address")]
    pub host_address: IpAddr,
    /// The status this node advertises to its peers.
    #[serde(default)]
    pub node_info: NodeInfo,
    /// Peers queried for their peer lists when the node starts.
    #[serde(default)]
    pub seed_peers: Vec<SocketAddr>,
    /// IP addresses never added through discovery.
    #[serde(default)]
    pub blacklisted_peers: Vec<IpAddr>,
    /// Outbound connect timeout in milliseconds.
    pub connect_timeout: Option<u64>,
    /// Request timeout in milliseconds.
    pub request_timeout: Option<u64>,
    /// Maximum number of peers a message is broadcast to.
    pub send_peer_limit: Option<usize>,
    /// Maximum size of a single frame on the wire.
    pub max_frame_size: Option<usize>,
    /// Maximum number of entries accepted in a peer list response.
    pub max_peer_list_size: Option<usize>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            host_address: default_host_address(),
            node_info: NodeInfo::default(),
            seed_peers: Vec::new(),
            blacklisted_peers: Vec::new(),
            connect_timeout: None,
            request_timeout: None,
            send_peer_limit: None,
            max_frame_size: None,
            max_peer_list_size: None,
        }
    }
}

fn default_host_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl P2pConfig {
    pub fn new(node_info: NodeInfo) -> Self {
        Self {
            node_info,
            ..Default::default()
        }
    }

    pub fn with_host_address(mut self, host_address: IpAddr) -> Self {
        self.host_address = host_address;
        self
    }

    pub fn with_seed_peers(mut self, seed_peers: Vec<SocketAddr>) -> Self {
        self.seed_peers = seed_peers;
        self
    }

    pub fn with_blacklisted_peers(mut self, blacklisted_peers: Vec<IpAddr>) -> Self {
        self.blacklisted_peers = blacklisted_peers;
        self
    }

    pub fn with_connect_timeout(mut self, millis: Option<u64>) -> Self {
        if millis.is_some() {
            self.connect_timeout = millis;
        }
        self
    }

    pub fn with_request_timeout(mut self, millis: Option<u64>) -> Self {
        if millis.is_some() {
            self.request_timeout = millis;
        }
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host_address, self.node_info.ws_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
    }

    pub fn send_peer_limit(&self) -> usize {
        self.send_peer_limit.unwrap_or(DEFAULT_SEND_PEER_LIMIT)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn max_peer_list_size(&self) -> usize {
        self.max_peer_list_size
            .unwrap_or(DEFAULT_MAX_PEER_LIST_SIZE)
    }

    /// Seed peers as peer infos, minus the blacklisted ones.
    pub fn seed_peer_infos(&self) -> Vec<PeerInfo> {
        self.seed_peers
            .iter()
            .filter(|addr| !self.blacklisted_peers.contains(&addr.ip()))
            .map(|addr| PeerInfo::new(addr.ip(), addr.port(), 0))
            .collect()
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.node_info.os.is_empty() {
            return Err(P2pError::InvalidConfig("node_info.os is empty".to_owned()));
        }
        if semver::Version::parse(&self.node_info.version).is_err() {
            return Err(P2pError::InvalidConfig(format!(
                "node_info.version '{}' is not a semantic version",
                self.node_info.version
            )));
        }
        if self.send_peer_limit() == 0 {
            return Err(P2pError::InvalidConfig(
                "send_peer_limit must be greater than 0".to_owned(),
            ));
        }
        if self.seed_peers.iter().any(|addr| addr.port() == 0) {
            return Err(P2pError::InvalidConfig(
                "seed peers must have a non-zero port".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = P2pConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_millis(5_000));
        assert_eq!(config.request_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.send_peer_limit(), 16);
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_config() {
        let config = P2pConfig::default()
            .with_connect_timeout(Some(200))
            .with_request_timeout(Some(300))
            .with_request_timeout(None);

        assert_eq!(config.connect_timeout(), Duration::from_millis(200));
        assert_eq!(config.request_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn seed_peers_skip_blacklisted_ips() {
        let config = P2pConfig::default()
            .with_seed_peers(vec![
                "10.0.0.1:5000".parse().unwrap(),
                "10.0.0.2:5000".parse().unwrap(),
            ])
            .with_blacklisted_peers(vec!["10.0.0.2".parse().unwrap()]);

        let seeds = config.seed_peer_infos();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].peer_id().as_str(), "10.0.0.1:5000");
    }

    #[test]
    fn invalid_version_is_rejected() {
        let mut config = P2pConfig::default();
        config.node_info.version = "one".to_owned();
        assert!(matches!(config.validate(), Err(P2pError::InvalidConfig(_))));
    }
}
